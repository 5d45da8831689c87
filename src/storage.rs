//! Station pairing credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Environment variables override the
//! keyring so headless deployments can skip pairing entirely.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "prepboard-kds";

// Credential keys
pub const KEY_SERVER_URL: &str = "server_url";
pub const KEY_API_KEY: &str = "api_key";
pub const KEY_STATION_ID: &str = "station_id";
pub const KEY_SITE_ID: &str = "site_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_SERVER_URL, KEY_API_KEY, KEY_STATION_ID, KEY_SITE_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Environment variable that overrides a given credential key, if any.
fn env_override_name(key: &str) -> Option<&'static str> {
    match key {
        KEY_SERVER_URL => Some("PREPBOARD_SERVER_URL"),
        KEY_API_KEY => Some("PREPBOARD_API_KEY"),
        KEY_STATION_ID => Some("PREPBOARD_STATION_ID"),
        _ => None,
    }
}

/// Resolve a credential, preferring environment overrides over the keyring.
pub fn resolve_credential(key: &str) -> Option<String> {
    if let Some(var) = env_override_name(key) {
        if let Ok(value) = std::env::var(var) {
            let value = value.trim().to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    get_credential(key)
}

pub fn has_credential(key: &str) -> bool {
    resolve_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The station is considered paired when server URL, station ID, and API key
/// are all resolvable.
pub fn is_configured() -> bool {
    has_credential(KEY_SERVER_URL) && has_credential(KEY_STATION_ID) && has_credential(KEY_API_KEY)
}

/// Return the stored station config as a JSON value for the pairing surface.
pub fn station_config() -> Value {
    serde_json::json!({
        "server_url": resolve_credential(KEY_SERVER_URL),
        "station_id": resolve_credential(KEY_STATION_ID),
        "site_id":    get_credential(KEY_SITE_ID),
        "api_key":    resolve_credential(KEY_API_KEY),
    })
}

/// Credentials extracted from a pairing payload, before anything is written
/// to the keyring.
#[derive(Debug, PartialEq, Eq)]
pub struct StationCredentials {
    pub server_url: Option<String>,
    pub api_key: String,
    pub station_id: String,
    pub site_id: Option<String>,
}

fn payload_field(payload: &Value, camel: &str, snake: &str) -> Option<String> {
    payload
        .get(camel)
        .or_else(|| payload.get(snake))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a pairing payload into credentials.
///
/// Expected JSON shape (camelCase, snake_case accepted as fallback):
/// ```json
/// {
///   "apiKey": "...",      // plain key or pairing code
///   "stationId": "...",   // optional when the pairing code carries it
///   "serverUrl": "...",   // optional
///   "siteId": "..."       // optional
/// }
/// ```
///
/// When `apiKey` is a pairing code, the decoded `key`/`url`/`sid` fields
/// backfill whatever the payload left out.
pub fn parse_credentials_payload(payload: &Value) -> Result<StationCredentials, String> {
    let raw_api_key = payload
        .get("apiKey")
        .or_else(|| payload.get("api_key"))
        .and_then(Value::as_str)
        .ok_or("Missing required field: apiKey")?;
    let mut station_id = payload_field(payload, "stationId", "station_id");
    let mut server_url = payload_field(payload, "serverUrl", "server_url");
    let site_id = payload_field(payload, "siteId", "site_id");

    let mut api_key = raw_api_key.trim().to_string();
    if let Some(decoded_key) = crate::api::extract_api_key_from_pairing_code(raw_api_key) {
        api_key = decoded_key;
        if station_id.is_none() {
            station_id = crate::api::extract_station_id_from_pairing_code(raw_api_key);
        }
        if server_url.is_none() {
            server_url = crate::api::extract_server_url_from_pairing_code(raw_api_key);
        }
    }

    let station_id = station_id.ok_or("Missing required field: stationId")?;
    if api_key.is_empty() {
        return Err("Missing required field: apiKey".to_string());
    }

    Ok(StationCredentials {
        server_url: server_url.map(|u| crate::api::normalize_server_url(&u)),
        api_key,
        station_id,
        site_id,
    })
}

/// Store station credentials received during pairing.
pub fn update_station_credentials(payload: &Value) -> Result<Value, String> {
    let creds = parse_credentials_payload(payload)?;

    set_credential(KEY_STATION_ID, &creds.station_id)?;
    set_credential(KEY_API_KEY, &creds.api_key)?;
    if let Some(url) = creds.server_url.as_deref() {
        if !url.is_empty() {
            set_credential(KEY_SERVER_URL, url)?;
        }
    }
    if let Some(sid) = creds.site_id.as_deref() {
        set_credential(KEY_SITE_ID, sid)?;
    }

    info!(station_id = %creds.station_id, "station credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential (factory reset / session revocation).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parses_camel_case_payload() {
        let payload = serde_json::json!({
            "apiKey": "  sk_live_abc  ",
            "stationId": "st-7",
            "serverUrl": "pos.example.com/api/",
            "siteId": "site-1",
        });
        let creds = parse_credentials_payload(&payload).unwrap();
        assert_eq!(creds.api_key, "sk_live_abc");
        assert_eq!(creds.station_id, "st-7");
        assert_eq!(creds.server_url.as_deref(), Some("https://pos.example.com"));
        assert_eq!(creds.site_id.as_deref(), Some("site-1"));
    }

    #[test]
    fn accepts_snake_case_fallbacks() {
        let payload = serde_json::json!({
            "api_key": "sk_live_abc",
            "station_id": "st-7",
        });
        let creds = parse_credentials_payload(&payload).unwrap();
        assert_eq!(creds.station_id, "st-7");
        assert_eq!(creds.server_url, None);
    }

    #[test]
    fn pairing_code_backfills_missing_fields() {
        let payload = serde_json::json!({
            "apiKey": r#"{"key":"sk_live_1","url":"https://pos.example.com","sid":"st-9"}"#,
        });
        let creds = parse_credentials_payload(&payload).unwrap();
        assert_eq!(creds.api_key, "sk_live_1");
        assert_eq!(creds.station_id, "st-9");
        assert_eq!(creds.server_url.as_deref(), Some("https://pos.example.com"));
    }

    #[test]
    fn explicit_fields_beat_pairing_code() {
        let payload = serde_json::json!({
            "apiKey": r#"{"key":"sk_live_1","url":"https://decoded.example.com","sid":"st-9"}"#,
            "stationId": "st-override",
        });
        let creds = parse_credentials_payload(&payload).unwrap();
        assert_eq!(creds.station_id, "st-override");
    }

    #[test]
    fn rejects_missing_api_key() {
        let payload = serde_json::json!({ "stationId": "st-7" });
        let err = parse_credentials_payload(&payload).unwrap_err();
        assert!(err.contains("apiKey"));
    }

    #[test]
    fn rejects_missing_station_id() {
        let payload = serde_json::json!({ "apiKey": "sk_live_abc" });
        let err = parse_credentials_payload(&payload).unwrap_err();
        assert!(err.contains("stationId"));
    }

    #[test]
    #[serial]
    fn env_override_wins() {
        std::env::set_var("PREPBOARD_SERVER_URL", "https://env.example.com");
        assert_eq!(
            resolve_credential(KEY_SERVER_URL).as_deref(),
            Some("https://env.example.com")
        );
        std::env::remove_var("PREPBOARD_SERVER_URL");
    }

    #[test]
    #[serial]
    fn blank_env_override_is_ignored() {
        std::env::set_var("PREPBOARD_STATION_ID", "   ");
        // Falls through to the keyring, which has no entry in tests.
        assert_eq!(resolve_credential(KEY_STATION_ID), None);
        std::env::remove_var("PREPBOARD_STATION_ID");
    }
}
