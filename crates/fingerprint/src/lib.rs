pub mod classifier;
pub mod html;
pub mod onion;
pub mod signatures;
pub mod url;

pub use classifier::{classify, Baseline, ProbeResponse, Verdict};
pub use html::{parse_page, PageExtract};
pub use onion::{extract_all_onions, extract_onion, is_valid_onion};
pub use signatures::{detect_service, probe_string};
pub use url::{classify_link, is_root_path, normalize_url, root_url};
