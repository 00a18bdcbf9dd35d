//! OAuth token set and its on-disk store.

use super::AuthError;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::{fs, io};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Local time at which `access_token` stops being accepted.
    #[serde(with = "expiration_format")]
    pub expiration_time: Option<NaiveDateTime>,
}

/// Body of a successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Honeywell sends this as a string; other servers send a number.
    #[serde(default, deserialize_with = "seconds_from_number_or_string")]
    pub expires_in: Option<i64>,
}

impl TokenSet {
    /// An all-empty token set, as written by `init`.
    pub fn empty() -> Self {
        TokenSet {
            access_token: String::new(),
            refresh_token: String::new(),
            expiration_time: None,
        }
    }

    /// Build a token set from a grant response received at `now`. A response
    /// without a refresh token keeps `previous_refresh`.
    pub fn from_response(
        resp: TokenResponse,
        previous_refresh: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<Self, AuthError> {
        if resp.access_token.is_empty() {
            return Err(AuthError::InvalidToken("empty access_token".into()));
        }
        let refresh_token = match resp.refresh_token {
            Some(r) if !r.is_empty() => r,
            _ => previous_refresh
                .map(str::to_string)
                .ok_or_else(|| AuthError::InvalidToken("missing refresh_token".into()))?,
        };
        let expiration_time = match resp.expires_in {
            Some(secs) if secs > 0 => Some(
                Duration::try_seconds(secs)
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| AuthError::InvalidToken(format!("expires_in {secs} out of range")))?,
            ),
            Some(secs) => return Err(AuthError::InvalidToken(format!("non-positive expires_in {secs}"))),
            None => None,
        };
        Ok(TokenSet {
            access_token: resp.access_token,
            refresh_token,
            expiration_time,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_empty()
    }

    pub fn seconds_until_expiration(&self, now: NaiveDateTime) -> Option<i64> {
        self.expiration_time.map(|exp| (exp - now).num_seconds())
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expiration_time.is_some_and(|exp| exp <= now)
    }
}

fn seconds_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(n)) => Ok(Some(n)),
        Some(Raw::Float(f)) => Ok(Some(f as i64)),
        Some(Raw::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expires_in is not a number: {s:?}"))),
    }
}

/// `expiration_time` is stored as an ISO-8601 local datetime, or `""` when
/// unknown.
mod expiration_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.format(FORMAT).to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(s.trim(), FORMAT)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io { path: PathBuf, source: io::Error },
    Json { path: PathBuf, source: serde_path_to_error::Error<serde_json::Error> },
    Encode(serde_json::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            StoreError::Json { path, source } => write!(f, "{}: {}", path.display(), source),
            StoreError::Encode(e) => write!(f, "encoding credentials failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Json { source, .. } => Some(source),
            StoreError::Encode(e) => Some(e),
        }
    }
}

/// Persistence hook for the current token set.
pub trait TokenStore {
    fn load(&self) -> Result<TokenSet, StoreError>;
    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError>;
}

/// Token set kept as a JSON file.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileTokenStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<TokenSet, StoreError> {
        let text = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        let de = &mut serde_json::Deserializer::from_str(&text);
        serde_path_to_error::deserialize(de).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes to a sibling temp file and renames it over the target, so a
    /// crash never leaves a half-written refresh token behind.
    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(tokens).map_err(StoreError::Encode)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    fn response(json: &str) -> TokenResponse {
        serde_json::from_str(json).expect("token response")
    }

    #[test]
    fn builds_from_honeywell_style_response() {
        let resp = response(r#"{"access_token":"a1","refresh_token":"r1","expires_in":"1799","token_type":"Bearer"}"#);
        let tokens = TokenSet::from_response(resp, None, noon()).unwrap();
        assert_eq!(tokens.access_token, "a1");
        assert_eq!(tokens.refresh_token, "r1");
        assert_eq!(tokens.expiration_time, Some(noon() + Duration::seconds(1799)));
        assert_eq!(tokens.seconds_until_expiration(noon()), Some(1799));
        assert!(!tokens.is_expired(noon()));
        assert!(tokens.is_expired(noon() + Duration::hours(1)));
    }

    #[test]
    fn numeric_expires_in_and_kept_refresh_token() {
        let resp = response(r#"{"access_token":"a2","expires_in":600}"#);
        let tokens = TokenSet::from_response(resp, Some("old"), noon()).unwrap();
        assert_eq!(tokens.refresh_token, "old");
        assert_eq!(tokens.expiration_time, Some(noon() + Duration::minutes(10)));
    }

    #[test]
    fn rejects_empty_access_token_and_past_expiry() {
        let resp = response(r#"{"access_token":"","refresh_token":"r","expires_in":60}"#);
        assert!(matches!(
            TokenSet::from_response(resp, None, noon()),
            Err(AuthError::InvalidToken(_))
        ));
        let resp = response(r#"{"access_token":"a","refresh_token":"r","expires_in":0}"#);
        assert!(matches!(
            TokenSet::from_response(resp, None, noon()),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn huge_expires_in_is_rejected() {
        for raw in [r#""99999999999999""#, "9223372036854775807"] {
            let resp = response(&format!(r#"{{"access_token":"a","refresh_token":"r","expires_in":{raw}}}"#));
            assert!(matches!(
                TokenSet::from_response(resp, None, noon()),
                Err(AuthError::InvalidToken(ref m)) if m.contains("out of range")
            ));
        }
    }

    #[test]
    fn credentials_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("honeywell-hold-store-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let store = FileTokenStore::new(dir.join("credentials.json"));

        store.save(&TokenSet::empty()).unwrap();
        let loaded = store.load().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.expiration_time, None);

        let tokens = TokenSet {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expiration_time: Some(noon() + Duration::microseconds(250)),
        };
        store.save(&tokens).unwrap();
        assert_eq!(store.load().unwrap(), tokens);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn reads_python_isoformat_timestamps() {
        let json = r#"{"access_token":"a","refresh_token":"r","expiration_time":"2024-03-01T12:29:59.123456"}"#;
        let tokens: TokenSet = serde_json::from_str(json).unwrap();
        let expected = noon() + Duration::seconds(1799) + Duration::microseconds(123456);
        assert_eq!(tokens.expiration_time, Some(expected));
    }

    #[test]
    fn missing_field_is_rejected() {
        let json = r#"{"access_token":"a","expiration_time":""}"#;
        assert!(serde_json::from_str::<TokenSet>(json).is_err());
    }
}
