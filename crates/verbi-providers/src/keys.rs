use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Mutex, OnceLock},
};

use anyhow::{anyhow, Result};
use serde::Serialize;
use verbi_storage::Settings;

pub const KEYRING_SERVICE: &str = "verbi";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAi,
    Groq,
    Deepgram,
    ElevenLabs,
    Cartesia,
}

impl Vendor {
    pub const ALL: [Vendor; 5] = [
        Vendor::OpenAi,
        Vendor::Groq,
        Vendor::Deepgram,
        Vendor::ElevenLabs,
        Vendor::Cartesia,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Groq => "groq",
            Vendor::Deepgram => "deepgram",
            Vendor::ElevenLabs => "elevenlabs",
            Vendor::Cartesia => "cartesia",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Vendor::OpenAi => "OpenAI",
            Vendor::Groq => "Groq",
            Vendor::Deepgram => "Deepgram",
            Vendor::ElevenLabs => "ElevenLabs",
            Vendor::Cartesia => "Cartesia",
        }
    }

    pub fn env_var(self) -> &'static str {
        match self {
            Vendor::OpenAi => "OPENAI_API_KEY",
            Vendor::Groq => "GROQ_API_KEY",
            Vendor::Deepgram => "DEEPGRAM_API_KEY",
            Vendor::ElevenLabs => "ELEVENLABS_API_KEY",
            Vendor::Cartesia => "CARTESIA_API_KEY",
        }
    }

    /// Settings field name; also the keyring user name.
    pub fn settings_key(self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai_api_key",
            Vendor::Groq => "groq_api_key",
            Vendor::Deepgram => "deepgram_api_key",
            Vendor::ElevenLabs => "elevenlabs_api_key",
            Vendor::Cartesia => "cartesia_api_key",
        }
    }

    fn from_settings(self, s: &Settings) -> Option<String> {
        let v = match self {
            Vendor::OpenAi => &s.openai_api_key,
            Vendor::Groq => &s.groq_api_key,
            Vendor::Deepgram => &s.deepgram_api_key,
            Vendor::ElevenLabs => &s.elevenlabs_api_key,
            Vendor::Cartesia => &s.cartesia_api_key,
        };
        non_empty(v.as_deref())
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let t = s.trim().to_ascii_lowercase();
        Vendor::ALL
            .into_iter()
            .find(|v| v.as_str() == t)
            .ok_or_else(|| anyhow!("unknown vendor: {s} (expected openai, groq, deepgram, elevenlabs or cartesia)"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyStatus {
    pub vendor: Vendor,
    pub configured: bool,
    pub source: String, // env|settings|memory|keyring
    pub reason: Option<String>,
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

// Keys set in this process, so they work even when the keyring cannot persist.
fn memory() -> &'static Mutex<HashMap<Vendor, String>> {
    static CACHE: OnceLock<Mutex<HashMap<Vendor, String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn load_from_memory(vendor: Vendor) -> Option<String> {
    let g = memory().lock().ok()?;
    non_empty(g.get(&vendor).map(String::as_str))
}

fn set_memory(vendor: Vendor, key: Option<&str>) {
    if let Ok(mut g) = memory().lock() {
        match non_empty(key) {
            Some(k) => g.insert(vendor, k),
            None => g.remove(&vendor),
        };
    }
}

fn entry(vendor: Vendor) -> Result<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, vendor.settings_key())
        .map_err(|e| anyhow!("keyring entry init failed: {e:?}"))
}

/// A missing entry is "not configured", not an error.
fn stored_key(read: keyring::Result<String>) -> Result<Option<String>> {
    match read {
        Ok(k) => Ok(non_empty(Some(&k))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(anyhow!("keyring get failed: {e:?}")),
    }
}

fn load_from_keyring(vendor: Vendor) -> Result<Option<String>> {
    stored_key(entry(vendor)?.get_password())
}

/// The key read back through a fresh entry must match what was written.
fn check_persisted(expected: &str, read: keyring::Result<String>) -> Result<()> {
    match stored_key(read)? {
        Some(k) if k == expected => Ok(()),
        Some(_) => Err(anyhow!("keyring returned a different key than was stored")),
        None => Err(anyhow!("keyring did not persist the key")),
    }
}

fn check_deleted(r: keyring::Result<()>) -> Result<()> {
    match r {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(anyhow!("keyring delete failed: {e:?}")),
    }
}

fn pick(env: Option<String>, settings: Option<String>) -> Option<(String, &'static str)> {
    non_empty(env.as_deref())
        .map(|k| (k, "env"))
        .or_else(|| settings.map(|k| (k, "settings")))
}

/// Environment, then the settings file, then this process, then the OS keyring.
pub fn resolve_api_key(vendor: Vendor, settings: &Settings) -> Option<String> {
    if let Some((k, _)) = pick(std::env::var(vendor.env_var()).ok(), vendor.from_settings(settings)) {
        return Some(k);
    }
    if let Some(k) = load_from_memory(vendor) {
        return Some(k);
    }
    match load_from_keyring(vendor) {
        Ok(k) => k,
        Err(e) => {
            tracing::debug!("{vendor} key not in keyring: {e:#}");
            None
        }
    }
}

pub fn set_api_key(vendor: Vendor, key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(anyhow!("empty api key"));
    }
    let key = key.trim();
    set_memory(vendor, Some(key));
    entry(vendor)?
        .set_password(key)
        .map_err(|e| anyhow!("keyring set failed: {e:?}"))?;
    check_persisted(key, entry(vendor)?.get_password())?;
    tracing::info!("{vendor} key stored in keyring");
    Ok(())
}

pub fn clear_api_key(vendor: Vendor) -> Result<()> {
    set_memory(vendor, None);
    check_deleted(entry(vendor)?.delete_credential())?;
    tracing::info!("{vendor} key removed from keyring");
    Ok(())
}

pub fn api_key_status(vendor: Vendor, settings: &Settings) -> ApiKeyStatus {
    let status = |configured: bool, source: &str, reason: Option<String>| ApiKeyStatus {
        vendor,
        configured,
        source: source.to_string(),
        reason,
    };
    if let Some((_, source)) = pick(std::env::var(vendor.env_var()).ok(), vendor.from_settings(settings)) {
        return status(true, source, None);
    }
    if load_from_memory(vendor).is_some() {
        return status(true, "memory", None);
    }
    match load_from_keyring(vendor) {
        Ok(Some(_)) => status(true, "keyring", None),
        Ok(None) => status(false, "keyring", Some("empty".to_string())),
        Err(e) => status(false, "keyring", Some(format!("{e:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_wins_over_settings() {
        assert_eq!(
            pick(Some("env-key".into()), Some("file-key".into())),
            Some(("env-key".to_string(), "env"))
        );
        assert_eq!(
            pick(Some("  ".into()), Some("file-key".into())),
            Some(("file-key".to_string(), "settings"))
        );
        assert_eq!(pick(None, None), None);
    }

    #[test]
    fn settings_key_is_read_per_vendor() {
        let s = Settings {
            deepgram_api_key: Some(" dg-1 ".to_string()),
            groq_api_key: Some(String::new()),
            ..Settings::default()
        };
        assert_eq!(Vendor::Deepgram.from_settings(&s).as_deref(), Some("dg-1"));
        assert_eq!(Vendor::Groq.from_settings(&s), None);
    }

    #[test]
    fn vendor_names_parse() {
        assert_eq!("ElevenLabs".parse::<Vendor>().unwrap(), Vendor::ElevenLabs);
        assert!("azure".parse::<Vendor>().is_err());
        assert_eq!(Vendor::Cartesia.env_var(), "CARTESIA_API_KEY");
    }

    #[test]
    fn missing_keyring_entry_is_not_an_error() {
        assert_eq!(stored_key(Err(keyring::Error::NoEntry)).unwrap(), None);
        assert_eq!(stored_key(Ok("  ".to_string())).unwrap(), None);
        assert_eq!(stored_key(Ok(" sk-1 ".to_string())).unwrap().as_deref(), Some("sk-1"));
        assert!(stored_key(Err(keyring::Error::BadEncoding(vec![0xff]))).is_err());
    }

    #[test]
    fn store_fails_when_key_does_not_read_back() {
        assert!(check_persisted("gsk-1", Ok("gsk-1".to_string())).is_ok());
        let lost = check_persisted("gsk-1", Err(keyring::Error::NoEntry)).unwrap_err();
        assert!(lost.to_string().contains("did not persist"), "{lost}");
        assert!(check_persisted("gsk-1", Ok("other".to_string())).is_err());
    }

    #[test]
    fn clearing_an_absent_key_succeeds_but_other_errors_surface() {
        assert!(check_deleted(Ok(())).is_ok());
        assert!(check_deleted(Err(keyring::Error::NoEntry)).is_ok());
        let e = check_deleted(Err(keyring::Error::BadEncoding(vec![]))).unwrap_err();
        assert!(e.to_string().contains("keyring delete failed"), "{e}");
    }

    #[test]
    fn memory_copy_counts_as_configured() {
        set_memory(Vendor::Cartesia, Some("mem-key"));
        assert_eq!(load_from_memory(Vendor::Cartesia).as_deref(), Some("mem-key"));
        set_memory(Vendor::Cartesia, None);
        assert_eq!(load_from_memory(Vendor::Cartesia), None);
    }
}
