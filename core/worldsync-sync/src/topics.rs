//! Topic namespace derivation.
//!
//! Every session owns a subtree of the broker's topic space:
//!
//! ```text
//! {root}/{session_id}/info              session metadata (retained)
//! {root}/{session_id}/control           presence, departures, state requests, teardown
//! {root}/{session_id}/entities          entity announce / update / remove
//! {root}/{session_id}/state/{client}    state snapshots addressed to one client
//! {root}/{session_id}/msg/{app_topic}   application messages
//! ```
//!
//! Session IDs are UUIDs, so two sessions sharing a broker never share a
//! subtree.

use crate::error::{SyncError, SyncResult};
use worldsync_types::{ClientId, SessionId};

/// Default topic root.
pub const DEFAULT_TOPIC_ROOT: &str = "worldsync/v1";

/// Derives the topics used by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    root: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            root: DEFAULT_TOPIC_ROOT.to_string(),
        }
    }
}

impl TopicScheme {
    /// Creates a scheme rooted at `root`. The root may not contain wildcards
    /// and may not start or end with `/`.
    pub fn new(root: impl Into<String>) -> SyncResult<Self> {
        let root = root.into();
        if root.is_empty()
            || root.starts_with('/')
            || root.ends_with('/')
            || root.contains(['+', '#', '\0'])
        {
            return Err(SyncError::Protocol(format!("invalid topic root: {root:?}")));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix shared by every topic of `session`.
    pub fn session_root(&self, session: &SessionId) -> String {
        format!("{}/{}", self.root, session)
    }

    pub fn info(&self, session: &SessionId) -> String {
        format!("{}/info", self.session_root(session))
    }

    pub fn control(&self, session: &SessionId) -> String {
        format!("{}/control", self.session_root(session))
    }

    pub fn entities(&self, session: &SessionId) -> String {
        format!("{}/entities", self.session_root(session))
    }

    /// Inbox for state snapshots addressed to `client`.
    pub fn state_inbox(&self, session: &SessionId, client: &ClientId) -> String {
        format!("{}/state/{}", self.session_root(session), client)
    }

    /// Session-scoped topic for an application topic.
    pub fn message(&self, session: &SessionId, app_topic: &str) -> SyncResult<String> {
        validate_app_topic(app_topic)?;
        Ok(format!("{}/msg/{}", self.session_root(session), app_topic))
    }

    /// Filter matching every application message of `session`.
    pub fn message_filter(&self, session: &SessionId) -> String {
        format!("{}/msg/#", self.session_root(session))
    }

    /// Recovers the application topic from a session-scoped message topic.
    pub fn app_topic<'a>(&self, session: &SessionId, topic: &'a str) -> Option<&'a str> {
        let prefix = format!("{}/msg/", self.session_root(session));
        topic.strip_prefix(prefix.as_str()).filter(|t| !t.is_empty())
    }

    /// Every topic a session member subscribes to.
    pub fn subscriptions(&self, session: &SessionId, client: &ClientId) -> Vec<String> {
        vec![
            self.info(session),
            self.control(session),
            self.entities(session),
            self.state_inbox(session, client),
            self.message_filter(session),
        ]
    }
}

/// Checks an application topic before it is embedded in a session topic.
pub fn validate_app_topic(app_topic: &str) -> SyncResult<()> {
    if app_topic.is_empty() {
        return Err(SyncError::Protocol("application topic is empty".into()));
    }
    if app_topic.contains(['+', '#', '\0']) {
        return Err(SyncError::Protocol(format!(
            "application topic {app_topic:?} contains wildcard characters"
        )));
    }
    Ok(())
}

/// Matches a concrete topic against a filter with `+` (one level) and `#`
/// (remaining levels, including none) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::parse("11111111-1111-1111-1111-111111111111").unwrap()
    }

    #[test]
    fn derives_session_topics() {
        let scheme = TopicScheme::default();
        let s = sid();
        assert_eq!(
            scheme.info(&s),
            "worldsync/v1/11111111-1111-1111-1111-111111111111/info"
        );
        assert_eq!(
            scheme.message(&s, "chat/global").unwrap(),
            "worldsync/v1/11111111-1111-1111-1111-111111111111/msg/chat/global"
        );
        let client = ClientId::new("bob").unwrap();
        assert_eq!(
            scheme.state_inbox(&s, &client),
            "worldsync/v1/11111111-1111-1111-1111-111111111111/state/bob"
        );
    }

    #[test]
    fn app_topic_roundtrip() {
        let scheme = TopicScheme::default();
        let s = sid();
        let topic = scheme.message(&s, "chat/global").unwrap();
        assert_eq!(scheme.app_topic(&s, &topic), Some("chat/global"));
        assert_eq!(scheme.app_topic(&SessionId::new(), &topic), None);
        assert_eq!(scheme.app_topic(&s, &scheme.control(&s)), None);
    }

    #[test]
    fn rejects_wildcards_in_app_topic() {
        let scheme = TopicScheme::default();
        assert!(scheme.message(&sid(), "chat/#").is_err());
        assert!(scheme.message(&sid(), "+").is_err());
        assert!(scheme.message(&sid(), "").is_err());
    }

    #[test]
    fn rejects_bad_roots() {
        assert!(TopicScheme::new("").is_err());
        assert!(TopicScheme::new("/abs").is_err());
        assert!(TopicScheme::new("trail/").is_err());
        assert!(TopicScheme::new("a/+/b").is_err());
        assert_eq!(TopicScheme::new("game/sync").unwrap().root(), "game/sync");
    }

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(!topic_matches("a/+/c", "a/x/y/c"));
        assert!(topic_matches("a/#", "a/x/y/z"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/#", "b/x"));
    }

    #[test]
    fn subscriptions_match_their_own_topics() {
        let scheme = TopicScheme::default();
        let s = sid();
        let me = ClientId::new("me").unwrap();
        let subs = scheme.subscriptions(&s, &me);
        let msg = scheme.message(&s, "x/y").unwrap();
        assert!(subs.iter().any(|f| topic_matches(f, &msg)));
        assert!(subs.iter().any(|f| topic_matches(f, &scheme.entities(&s))));
        let other_inbox = scheme.state_inbox(&s, &ClientId::new("other").unwrap());
        assert!(!subs.iter().any(|f| topic_matches(f, &other_inbox)));
    }
}
