use chrono::Utc;
use rand::Rng;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 6;

/// Run ids are `<UTC YYYYMMDDTHHMMSSZ>-<6 char suffix>` so directory listings
/// sort chronologically.
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{timestamp}-{suffix}")
}

pub fn is_valid_run_id(raw: &str) -> bool {
    let Some((stamp, suffix)) = raw.split_once('-') else {
        return false;
    };
    if stamp.len() != 16 || !stamp.ends_with('Z') || stamp.as_bytes().get(8) != Some(&b'T') {
        return false;
    }
    if !stamp[..8].bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if !stamp[9..15].bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    suffix.len() == SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

pub fn validate_step_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("step name must be non-empty".to_string());
    }
    if name == "_end" {
        return Err("step name `_end` is reserved".to_string());
    }
    if name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err("step name must use only ASCII letters, digits, '-' or '_'".to_string())
}

pub fn now_utc_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
