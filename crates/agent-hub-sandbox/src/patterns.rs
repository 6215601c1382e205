//! Secret and hardcoded-path detection for the safety scan step of the gate
//! (§4.8 step 6), plus the sensitive source-filename check (step: source
//! read validation).

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::SafetyReport;

const SENSITIVE_SUBSTRINGS: &[&str] = &[".env", "credentials", "secret", ".key", ".pem"];

fn secret_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r#"(?i)(api_key|password|secret)\s*=\s*['"][^'"]{8,}['"]"#).unwrap(),
            Regex::new(r"sk-[A-Za-z0-9]{20,}").unwrap(),
            Regex::new(r"AIza[A-Za-z0-9_\-]{30,}").unwrap(),
        ]
    })
}

fn path_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"/Users/[A-Za-z0-9_\-]+").unwrap(),
            Regex::new(r"/home/[A-Za-z0-9_\-]+").unwrap(),
            Regex::new(r"C:\\Users\\[A-Za-z0-9_\-]+").unwrap(),
        ]
    })
}

pub fn is_sensitive_filename(path: &Path) -> bool {
    let name = path.to_string_lossy().to_lowercase();
    SENSITIVE_SUBSTRINGS.iter().any(|needle| name.contains(needle))
}

pub fn scan(content: &str) -> SafetyReport {
    let mut secret_hits = Vec::new();
    for pattern in secret_patterns() {
        if let Some(m) = pattern.find(content) {
            secret_hits.push(m.as_str().to_string());
        }
    }

    let mut path_hits = Vec::new();
    for pattern in path_patterns() {
        if let Some(m) = pattern.find(content) {
            path_hits.push(m.as_str().to_string());
        }
    }

    SafetyReport { secret_hits, path_hits }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_openai_style_token() {
        let report = scan("const KEY: &str = \"sk-abcdefghijklmnopqrstuvwxyz\";");
        assert!(!report.secret_hits.is_empty());
    }

    #[test]
    fn detects_assignment_style_secret() {
        let report = scan(r#"password = "hunter2hunter2""#);
        assert!(!report.secret_hits.is_empty());
    }

    #[test]
    fn detects_home_directory_path() {
        let report = scan("let path = \"/home/erik/secrets.txt\";");
        assert!(!report.path_hits.is_empty());
    }

    #[test]
    fn clean_content_has_no_hits() {
        let report = scan("fn add(a: i32, b: i32) -> i32 { a + b }");
        assert!(report.is_clean());
    }

    #[test]
    fn sensitive_filenames_are_flagged() {
        assert!(is_sensitive_filename(Path::new("/workspace/.env")));
        assert!(is_sensitive_filename(Path::new("/workspace/id_rsa.pem")));
        assert!(!is_sensitive_filename(Path::new("/workspace/src/lib.rs")));
    }
}
