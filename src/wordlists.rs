use asherah_core::types::DirscanProfile;

/// High-yield paths probed on every profile.
const QUICK: &[&str] = &[
    "admin",
    "admin/login",
    "login",
    "panel",
    "dashboard",
    ".env",
    ".git/config",
    ".git/HEAD",
    ".htaccess",
    ".htpasswd",
    "backup",
    "backup.zip",
    "backup.sql",
    "config.php",
    "wp-config.php.bak",
    "wp-admin",
    "phpmyadmin",
    "phpinfo.php",
    "server-status",
    "robots.txt",
    "sitemap.xml",
    "db.sql",
    "dump.sql",
    "private",
];

/// Added on the standard profile.
const STANDARD: &[&str] = &[
    "administrator",
    "admin.php",
    "admin/index.php",
    "adminer.php",
    "auth",
    "signin",
    "user/login",
    "cpanel",
    "manage",
    "management",
    "console",
    "backend",
    ".env.bak",
    ".env.local",
    ".env.production",
    ".git",
    ".gitignore",
    ".svn/entries",
    ".hg",
    ".ssh/id_rsa",
    ".ssh/authorized_keys",
    ".bash_history",
    ".DS_Store",
    "backup.tar.gz",
    "backups",
    "site.zip",
    "www.zip",
    "old",
    "old.zip",
    "database.sql",
    "database.sqlite",
    "db.sqlite3",
    "data.db",
    "users.sql",
    "mysql.sql",
    "config",
    "config.yml",
    "config.yaml",
    "config.json",
    "config.inc.php",
    "configuration.php",
    "settings.php",
    "settings.py",
    "web.config",
    "wp-config.php",
    "wp-login.php",
    "wp-content/uploads",
    "composer.json",
    "package.json",
    "info.php",
    "test.php",
    "server-info",
    "status",
    "logs",
    "log",
    "error.log",
    "access.log",
    "debug.log",
    "error_log",
    "tmp",
    "temp",
    "uploads",
    "files",
    "download",
    "downloads",
    "static",
    "assets",
    "api",
    "api/v1",
    "api/swagger.json",
    "swagger-ui.html",
    "graphql",
    "xmlrpc.php",
    "crossdomain.xml",
    "security.txt",
    ".well-known/security.txt",
    "readme.txt",
    "README.md",
    "CHANGELOG.md",
    "LICENSE",
    "install",
    "install.php",
    "setup",
    "setup.php",
    "register",
    "signup",
    "mail",
    "webmail",
    "search",
    "secret",
    "secrets",
    "hidden",
    "internal",
];

/// Added on the full profile.
const FULL: &[&str] = &[
    "admin/config",
    "admin/db",
    "admin/backup",
    "admin/logs",
    "admin/users",
    "admin/upload",
    "admin_area",
    "adminpanel",
    "admincp",
    "moderator",
    "webadmin",
    "pma",
    "phpMyAdmin",
    "phppgadmin",
    "mysqladmin",
    "sqladmin",
    "dbadmin",
    "sysadmin",
    "cms",
    "panel.php",
    "login.php",
    "login.html",
    "login/admin",
    "account/login",
    "users",
    "user",
    "members",
    "member",
    "profile",
    "account",
    "accounts",
    "passwords.txt",
    "password.txt",
    "pass.txt",
    "credentials.txt",
    "creds.txt",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
    "key.pem",
    "server.key",
    "privatekey.pem",
    "cert.pem",
    "keys",
    "backup/db",
    "backup/site",
    "backup1.zip",
    "backup2.zip",
    "bak",
    "bak.zip",
    "archive.zip",
    "archive.tar.gz",
    "dump.tar.gz",
    "export.sql",
    "export.csv",
    "data.sql",
    "data.zip",
    "site.tar.gz",
    "website.zip",
    "sql",
    "sql.zip",
    "db_backup.sql",
    "db_dump.sql",
    "mysqldump.sql",
    "postgres.sql",
    "pg_dump.sql",
    "sqlite.db",
    "app.db",
    "application.db",
    "storage/logs/laravel.log",
    "app/config/parameters.yml",
    "application/config/database.php",
    "includes/config.php",
    "inc/config.php",
    "conf/config.ini",
    "config.ini",
    "config.toml",
    "config.xml",
    "app.config",
    "appsettings.json",
    "local.settings.json",
    "docker-compose.yml",
    "Dockerfile",
    ".dockerenv",
    "Makefile",
    "Gemfile",
    "requirements.txt",
    "yarn.lock",
    "package-lock.json",
    "node_modules",
    "vendor",
    "vendor/composer/installed.json",
    "cgi-bin",
    "cgi-bin/test.cgi",
    "shell.php",
    "cmd.php",
    "upload.php",
    "uploader.php",
    "filemanager",
    "file-manager",
    "elfinder",
    "kcfinder",
    "browser",
    "explore",
    "tree",
    "list",
    "dir",
    "stats",
    "statistics",
    "analytics",
    "munin",
    "nagios",
    "zabbix",
    "grafana",
    "kibana",
    "prometheus",
    "metrics",
    "health",
    "healthz",
    "debug",
    "trace",
    "actuator",
    "actuator/env",
    "actuator/health",
    "env",
    "environment",
    ".vscode/settings.json",
    ".idea/workspace.xml",
    "nbproject/project.properties",
    "WEB-INF/web.xml",
    "META-INF/MANIFEST.MF",
    "core",
    "error",
    "errors",
    "exception",
    "forum",
    "board",
    "chat",
    "irc",
    "market",
    "shop",
    "store",
    "cart",
    "orders",
    "invoice",
    "invoices",
    "payment",
    "payments",
    "wallet",
    "btc",
    "bitcoin",
    "monero",
    "escrow",
    "vendor-area",
    "support",
    "ticket",
    "tickets",
    "feedback",
    "contact",
    "about",
    "faq",
    "news",
    "blog",
    "wiki",
    "docs",
    "documentation",
    "help",
    "old-site",
    "new",
    "dev",
    "development",
    "staging",
    "test",
    "testing",
    "beta",
    "demo",
    "mirror",
    "mirrors",
];

/// Paths for a profile. Each tier extends the one below it.
pub fn paths(profile: DirscanProfile) -> Vec<&'static str> {
    match profile {
        DirscanProfile::Quick => QUICK.to_vec(),
        DirscanProfile::Standard => QUICK.iter().chain(STANDARD).copied().collect(),
        DirscanProfile::Full => QUICK
            .iter()
            .chain(STANDARD)
            .chain(FULL)
            .copied()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_supersets() {
        let quick = paths(DirscanProfile::Quick);
        let standard = paths(DirscanProfile::Standard);
        let full = paths(DirscanProfile::Full);
        assert!(quick.len() < standard.len());
        assert!(standard.len() < full.len());
        assert!(quick.iter().all(|p| standard.contains(p)));
        assert!(standard.iter().all(|p| full.contains(p)));
    }

    #[test]
    fn no_duplicate_paths() {
        let full = paths(DirscanProfile::Full);
        let unique: std::collections::HashSet<_> = full.iter().collect();
        assert_eq!(unique.len(), full.len());
    }

    #[test]
    fn paths_have_no_leading_slash() {
        assert!(paths(DirscanProfile::Full).iter().all(|p| !p.starts_with('/')));
    }
}
