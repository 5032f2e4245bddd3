use anyhow::Result;

use asherah_core::types::{DetectedService, DirObservation, PageDocument, PortObservation};

use crate::Storage;

impl Storage {
    /// Register a target on first discovery. Idempotent.
    pub async fn upsert_target(&self, onion_address: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO targets (onion_address) VALUES ($1)
             ON CONFLICT (onion_address) DO NOTHING",
        )
        .bind(onion_address)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persist one fetched document with its edges and headers, all in one
    /// transaction. Re-fetching the same URL updates in place.
    pub async fn store_page(&self, doc: &PageDocument) -> Result<i64> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO targets (onion_address) VALUES ($1)
             ON CONFLICT (onion_address) DO NOTHING",
        )
        .bind(&doc.onion_address)
        .execute(&mut *tx)
        .await?;

        let row: (i64,) = sqlx::query_as(
            r#"INSERT INTO pages (url, onion_address, path, status_code, content_size, title, description, language, h1, body_text, body_html, fetched_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (url) DO UPDATE SET
                   status_code = EXCLUDED.status_code,
                   content_size = EXCLUDED.content_size,
                   title = EXCLUDED.title,
                   description = EXCLUDED.description,
                   language = EXCLUDED.language,
                   h1 = EXCLUDED.h1,
                   body_text = EXCLUDED.body_text,
                   body_html = EXCLUDED.body_html,
                   fetched_at = EXCLUDED.fetched_at
               RETURNING id"#,
        )
        .bind(&doc.url)
        .bind(&doc.onion_address)
        .bind(&doc.path)
        .bind(doc.status)
        .bind(doc.content_size)
        .bind(&doc.metadata.title)
        .bind(&doc.metadata.description)
        .bind(&doc.metadata.language)
        .bind(&doc.metadata.h1)
        .bind(&doc.body_text)
        .bind(&doc.body_html)
        .bind(doc.fetched_at)
        .fetch_one(&mut *tx)
        .await?;
        let page_id = row.0;

        if !doc.links.is_empty() {
            let mut urls: Vec<String> = Vec::with_capacity(doc.links.len());
            let mut onions: Vec<Option<String>> = Vec::with_capacity(doc.links.len());
            let mut anchors: Vec<Option<String>> = Vec::with_capacity(doc.links.len());
            let mut scopes: Vec<String> = Vec::with_capacity(doc.links.len());
            let mut kinds: Vec<String> = Vec::with_capacity(doc.links.len());
            let mut positions: Vec<i32> = Vec::with_capacity(doc.links.len());
            for link in &doc.links {
                urls.push(link.url.clone());
                onions.push(link.onion.clone());
                anchors.push(link.anchor_text.clone());
                scopes.push(link.scope.as_str().to_string());
                kinds.push(link.kind.as_str().to_string());
                positions.push(link.position);
            }
            sqlx::query(
                "INSERT INTO links (source_page_id, target_url, target_onion, anchor_text, scope, element_kind, position)
                 SELECT $1, * FROM UNNEST($2::text[], $3::varchar[], $4::text[], $5::varchar[], $6::varchar[], $7::int[])
                 ON CONFLICT (source_page_id, target_url) DO NOTHING",
            )
            .bind(page_id)
            .bind(&urls)
            .bind(&onions)
            .bind(&anchors)
            .bind(&scopes)
            .bind(&kinds)
            .bind(&positions)
            .execute(&mut *tx)
            .await?;
        }

        if !doc.headers.is_empty() {
            let mut names: Vec<String> = Vec::with_capacity(doc.headers.len());
            let mut values: Vec<String> = Vec::with_capacity(doc.headers.len());
            for (name, value) in &doc.headers {
                names.push(name.to_ascii_lowercase());
                values.push(value.clone());
            }
            sqlx::query(
                "INSERT INTO page_headers (page_id, name, value)
                 SELECT $1, * FROM UNNEST($2::varchar[], $3::text[])
                 ON CONFLICT (page_id, name) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(page_id)
            .bind(&names)
            .bind(&values)
            .execute(&mut *tx)
            .await?;
        }

        // Aggregates the scheduler tiers read: page depth per target, and
        // the root title as the target's display title.
        sqlx::query(
            "UPDATE targets SET
                 page_count = (SELECT COUNT(*) FROM pages WHERE onion_address = $1),
                 title = CASE WHEN $2 = '/' THEN COALESCE($3, title) ELSE title END
             WHERE onion_address = $1",
        )
        .bind(&doc.onion_address)
        .bind(&doc.path)
        .bind(&doc.metadata.title)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(page_id)
    }

    /// Upsert one port probe. A fresh null banner never erases an earlier
    /// captured one.
    pub async fn store_port_observation(
        &self,
        onion_address: &str,
        obs: &PortObservation,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO port_scans (onion_address, port, state, response_time_ms, banner, scanned_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (onion_address, port) DO UPDATE SET
                 state = EXCLUDED.state,
                 response_time_ms = EXCLUDED.response_time_ms,
                 banner = COALESCE(EXCLUDED.banner, port_scans.banner),
                 scanned_at = NOW()
             RETURNING id",
        )
        .bind(onion_address)
        .bind(obs.port as i32)
        .bind(obs.state.as_str())
        .bind(obs.response_time_ms as i32)
        .bind(&obs.banner)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    pub async fn store_detected_service(
        &self,
        port_scan_id: i64,
        service: &DetectedService,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO detected_services (port_scan_id, service, version, confidence, banner)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (port_scan_id, service) DO UPDATE SET
                 version = EXCLUDED.version,
                 confidence = EXCLUDED.confidence,
                 banner = EXCLUDED.banner,
                 detected_at = NOW()",
        )
        .bind(port_scan_id)
        .bind(&service.service)
        .bind(&service.version)
        .bind(service.confidence as i32)
        .bind(&service.banner)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn store_dir_observation(
        &self,
        onion_address: &str,
        obs: &DirObservation,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO dirscan_results (onion_address, path, status_code, content_length, content_type, response_time_ms, server_header, redirect_url, body_snippet, is_interesting, interest_category, scanned_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
             ON CONFLICT (onion_address, path) DO UPDATE SET
                 status_code = EXCLUDED.status_code,
                 content_length = EXCLUDED.content_length,
                 content_type = EXCLUDED.content_type,
                 response_time_ms = EXCLUDED.response_time_ms,
                 server_header = EXCLUDED.server_header,
                 redirect_url = EXCLUDED.redirect_url,
                 body_snippet = EXCLUDED.body_snippet,
                 is_interesting = EXCLUDED.is_interesting,
                 interest_category = EXCLUDED.interest_category,
                 scanned_at = NOW()",
        )
        .bind(onion_address)
        .bind(&obs.path)
        .bind(obs.status)
        .bind(obs.content_length)
        .bind(&obs.content_type)
        .bind(obs.response_time_ms as i32)
        .bind(&obs.server_header)
        .bind(&obs.redirect_url)
        .bind(&obs.body_snippet)
        .bind(obs.interesting)
        .bind(obs.category.map(|c| c.as_str()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
