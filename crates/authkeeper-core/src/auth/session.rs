use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Request;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::client::{COMPARISONS_PATH, IDENTITY_PATH};
use crate::api::{RequestInterceptor, ResponseInterceptor, ResponseMeta};
use crate::store::{keys, KeyValueStore, StoreError};

/// Session continuity header
pub const SESSION_HEADER: &str = "x-session";

/// Device continuity header, survives logout
pub const IDENTIFICATION_HEADER: &str = "x-identification";

/// Idle time after which a session is considered expired.
pub const IDLE_THRESHOLD_HOURS: i64 = 2;

/// Paths whose requests carry session headers by default
pub fn default_session_paths() -> Vec<String> {
    vec![COMPARISONS_PATH.to_string(), IDENTITY_PATH.to_string()]
}

/// Point-in-time view of the session entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: Option<String>,
    pub identification_id: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Tracks the idle session and attaches session headers to allow-listed requests.
///
/// Sole writer of the `session-id`, `session-timestamp` and `identification-id` entries.
#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<dyn KeyValueStore>,
    idle_threshold: Duration,
    paths: Vec<String>,
}

impl SessionTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        idle_threshold: Duration,
        paths: Vec<String>,
    ) -> Self {
        Self {
            store,
            idle_threshold,
            paths,
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let raw = match self.store.get(keys::SESSION_TIMESTAMP) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read session timestamp");
                return None;
            }
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable session timestamp");
                None
            }
        }
    }

    /// Expired when no activity is recorded or the session has been idle too long.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_activity() {
            Some(last) => now - last > self.idle_threshold,
            None => true,
        }
    }

    pub fn record_activity(&self) -> Result<(), StoreError> {
        self.record_activity_at(Utc::now())
    }

    fn record_activity_at(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        // last_activity only moves forward
        if let Some(last) = self.last_activity() {
            if last >= now {
                return Ok(());
            }
        }
        self.store.set(keys::SESSION_TIMESTAMP, &now.to_rfc3339())
    }

    /// Drop the session id and activity timestamp. The identification id stays.
    pub fn clear(&self) -> Result<(), StoreError> {
        let session = self.store.delete(keys::SESSION_ID);
        let timestamp = self.store.delete(keys::SESSION_TIMESTAMP);
        session.and(timestamp)
    }

    pub fn session_id(&self) -> Option<String> {
        self.store.get(keys::SESSION_ID).ok().flatten()
    }

    pub fn identification_id(&self) -> Option<String> {
        self.store.get(keys::IDENTIFICATION_ID).ok().flatten()
    }

    pub fn snapshot(&self) -> SessionData {
        SessionData {
            session_id: self.session_id(),
            identification_id: self.identification_id(),
            last_activity: self.last_activity(),
        }
    }

    /// Whether requests to `path` take part in session tracking.
    /// Matches the path itself and anything below it, segment-wise.
    pub fn is_tracked_path(&self, path: &str) -> bool {
        self.paths.iter().any(|allowed| {
            let allowed = allowed.trim_end_matches('/');
            match path.strip_prefix(allowed) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
    }

    fn attach(request: &mut Request, name: &'static str, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                request.headers_mut().insert(name, value);
            }
            Err(_) => warn!(header = name, "Stored value is not a valid header value, omitting it"),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

impl RequestInterceptor for SessionTracker {
    fn on_request(&self, request: &mut Request) {
        if !self.is_tracked_path(request.url().path()) {
            return;
        }
        if let Some(identification) = self.identification_id() {
            Self::attach(request, IDENTIFICATION_HEADER, &identification);
        }
        if self.is_expired() {
            if self.session_id().is_some() {
                debug!(path = request.url().path(), "Session went idle, discarding it");
                if let Err(e) = self.clear() {
                    warn!(error = %e, "Failed to clear idle session");
                }
            }
            return;
        }
        if let Some(session) = self.session_id() {
            Self::attach(request, SESSION_HEADER, &session);
        }
    }
}

impl ResponseInterceptor for SessionTracker {
    fn on_response(&self, response: &ResponseMeta<'_>) {
        if !self.is_tracked_path(response.url.path()) {
            return;
        }
        let session = header_value(response.headers, SESSION_HEADER);
        let identification = header_value(response.headers, IDENTIFICATION_HEADER);
        if session.is_none() && identification.is_none() {
            return;
        }

        let mut result = Ok(());
        if let Some(session) = session {
            result = result.and(self.store.set(keys::SESSION_ID, session));
        }
        if let Some(identification) = identification {
            result = result.and(self.store.set(keys::IDENTIFICATION_ID, identification));
        }
        let result = result.and_then(|_| self.record_activity());
        match result {
            Ok(()) => debug!(path = response.url.path(), "Session acknowledged by server"),
            Err(e) => warn!(error = %e, "Failed to persist session headers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Origin;
    use reqwest::{Method, StatusCode, Url};

    fn tracker() -> (SessionTracker, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(Origin::in_memory().open_context());
        let tracker = SessionTracker::new(
            Arc::clone(&store),
            Duration::hours(IDLE_THRESHOLD_HOURS),
            default_session_paths(),
        );
        (tracker, store)
    }

    fn request(path: &str) -> Request {
        let url = Url::parse(&format!("https://admin.example.test{}", path)).unwrap();
        Request::new(Method::POST, url)
    }

    #[test]
    fn test_no_activity_means_expired() {
        let (tracker, _) = tracker();
        assert!(tracker.is_expired());
    }

    #[test]
    fn test_idle_expiry_threshold() {
        let (tracker, store) = tracker();
        let now = Utc::now();

        store
            .set(keys::SESSION_TIMESTAMP, &(now - Duration::hours(3)).to_rfc3339())
            .unwrap();
        assert!(tracker.is_expired_at(now));

        store
            .set(keys::SESSION_TIMESTAMP, &(now - Duration::hours(1)).to_rfc3339())
            .unwrap();
        assert!(!tracker.is_expired_at(now));
    }

    #[test]
    fn test_unparseable_timestamp_is_expired() {
        let (tracker, store) = tracker();
        store.set(keys::SESSION_TIMESTAMP, "yesterday").unwrap();
        assert_eq!(tracker.last_activity(), None);
        assert!(tracker.is_expired());
    }

    #[test]
    fn test_record_activity_never_moves_backwards() {
        let (tracker, _) = tracker();
        let now = Utc::now();
        tracker.record_activity_at(now).unwrap();
        tracker.record_activity_at(now - Duration::minutes(5)).unwrap();
        assert_eq!(tracker.last_activity().unwrap().timestamp(), now.timestamp());

        tracker.record_activity_at(now + Duration::minutes(5)).unwrap();
        assert_eq!(
            tracker.last_activity().unwrap().timestamp(),
            (now + Duration::minutes(5)).timestamp()
        );
    }

    #[test]
    fn test_clear_keeps_identification() {
        let (tracker, store) = tracker();
        store.set(keys::SESSION_ID, "s1").unwrap();
        store.set(keys::IDENTIFICATION_ID, "device-1").unwrap();
        tracker.record_activity().unwrap();

        tracker.clear().unwrap();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.session_id, None);
        assert_eq!(snapshot.last_activity, None);
        assert_eq!(snapshot.identification_id.as_deref(), Some("device-1"));
    }

    #[test]
    fn test_tracked_path_matching() {
        let (tracker, _) = tracker();
        assert!(tracker.is_tracked_path("/comparisons"));
        assert!(tracker.is_tracked_path("/comparisons/42"));
        assert!(tracker.is_tracked_path("/identity"));
        assert!(!tracker.is_tracked_path("/comparisonsx"));
        assert!(!tracker.is_tracked_path("/leaderboards"));
        assert!(!tracker.is_tracked_path("/"));
    }

    #[test]
    fn test_request_headers_on_active_session() {
        let (tracker, store) = tracker();
        store.set(keys::SESSION_ID, "s1").unwrap();
        store.set(keys::IDENTIFICATION_ID, "device-1").unwrap();
        tracker.record_activity().unwrap();

        let mut req = request("/comparisons");
        tracker.on_request(&mut req);
        assert_eq!(req.headers()[SESSION_HEADER], "s1");
        assert_eq!(req.headers()[IDENTIFICATION_HEADER], "device-1");
    }

    #[test]
    fn test_idle_session_header_is_omitted() {
        let (tracker, store) = tracker();
        store.set(keys::SESSION_ID, "s1").unwrap();
        store.set(keys::IDENTIFICATION_ID, "device-1").unwrap();
        store
            .set(
                keys::SESSION_TIMESTAMP,
                &(Utc::now() - Duration::hours(3)).to_rfc3339(),
            )
            .unwrap();

        let mut req = request("/comparisons");
        tracker.on_request(&mut req);
        assert!(req.headers().get(SESSION_HEADER).is_none());
        assert_eq!(req.headers()[IDENTIFICATION_HEADER], "device-1");

        // The idle session is dropped, the device id is not
        assert_eq!(store.get(keys::SESSION_ID).unwrap(), None);
        assert_eq!(store.get(keys::SESSION_TIMESTAMP).unwrap(), None);
        assert_eq!(tracker.identification_id().as_deref(), Some("device-1"));
    }

    #[test]
    fn test_idle_session_on_other_path_is_kept() {
        let (tracker, store) = tracker();
        store.set(keys::SESSION_ID, "s1").unwrap();

        let mut req = request("/templates");
        tracker.on_request(&mut req);
        assert_eq!(store.get(keys::SESSION_ID).unwrap().as_deref(), Some("s1"));
    }

    #[test]
    fn test_other_paths_are_untouched() {
        let (tracker, store) = tracker();
        store.set(keys::SESSION_ID, "s1").unwrap();
        store.set(keys::IDENTIFICATION_ID, "device-1").unwrap();
        tracker.record_activity().unwrap();

        let mut req = request("/templates");
        tracker.on_request(&mut req);
        assert!(req.headers().is_empty());
    }

    #[test]
    fn test_response_headers_are_stored() {
        let (tracker, _) = tracker();
        let url = Url::parse("https://admin.example.test/identity").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("s2"));
        headers.insert(IDENTIFICATION_HEADER, HeaderValue::from_static("device-2"));

        tracker.on_response(&ResponseMeta {
            url: &url,
            status: StatusCode::OK,
            headers: &headers,
        });

        assert_eq!(tracker.session_id().as_deref(), Some("s2"));
        assert_eq!(tracker.identification_id().as_deref(), Some("device-2"));
        assert!(!tracker.is_expired());
    }

    #[test]
    fn test_response_without_headers_does_not_extend_session() {
        let (tracker, _) = tracker();
        let url = Url::parse("https://admin.example.test/comparisons").unwrap();
        let headers = HeaderMap::new();
        tracker.on_response(&ResponseMeta {
            url: &url,
            status: StatusCode::OK,
            headers: &headers,
        });
        assert_eq!(tracker.last_activity(), None);
    }

    #[test]
    fn test_response_on_other_path_is_ignored() {
        let (tracker, _) = tracker();
        let url = Url::parse("https://admin.example.test/models").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("s3"));
        tracker.on_response(&ResponseMeta {
            url: &url,
            status: StatusCode::OK,
            headers: &headers,
        });
        assert_eq!(tracker.session_id(), None);
    }
}
