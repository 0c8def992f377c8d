use crate::session::SessionConfig;
use anyhow::{Context, Result};
use serde::Serialize;

/// Query parameters of the WebSocket connection URL.
///
/// Field order is the wire order.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    member_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_num_members: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    private: Option<bool>,
}

impl<'a> ConnectionQuery<'a> {
    fn from_config(config: &'a SessionConfig) -> Self {
        // A known member id lets the server resume identity without renegotiating
        if let Some(member_id) = config.member_id.as_deref() {
            return Self {
                member_id: Some(member_id),
                session_id: config.session_id.as_deref(),
                ..Default::default()
            };
        }

        let mut query = Self {
            session_type: Some(&config.session_type),
            ..Default::default()
        };

        match config.session_id.as_deref() {
            Some(session_id) => query.session_id = Some(session_id),
            None => {
                if config.num_members != 0 {
                    query.target_num_members = Some(config.num_members);
                }
                if config.is_private {
                    query.private = Some(true);
                }
            }
        }

        query
    }
}

/// Builds `{ws_url}?{query}` for a connection attempt.
pub fn connection_url(ws_url: &str, config: &SessionConfig) -> Result<String> {
    let query = serde_urlencoded::to_string(ConnectionQuery::from_config(config))
        .context("Failed to encode connection query")?;

    if query.is_empty() {
        return Ok(ws_url.to_string());
    }
    Ok(format!("{}?{}", ws_url, query))
}

/// `GET {http_url}/ping`
pub fn ping_url(http_url: &str) -> String {
    format!("{}/ping", http_url.trim_end_matches('/'))
}

/// `GET {http_url}/notifyDisconnect/{memberId}`
pub fn notify_disconnect_url(http_url: &str, member_id: &str) -> String {
    format!(
        "{}/notifyDisconnect/{}",
        http_url.trim_end_matches('/'),
        urlencoding::encode(member_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const WS: &str = "ws://relay.test/ws";

    #[test]
    fn test_member_id_only() {
        let mut config = SessionConfig::random("p1", "duel", 2);
        config.member_id = Some("m1".to_string());
        assert_eq!(connection_url(WS, &config).unwrap(), "ws://relay.test/ws?memberId=m1");
    }

    #[test]
    fn test_member_id_with_session_id() {
        let mut config = SessionConfig::host_private("p1", "duel", 2);
        config.member_id = Some("m1".to_string());
        config.session_id = Some("S9".to_string());
        assert_eq!(
            connection_url(WS, &config).unwrap(),
            "ws://relay.test/ws?memberId=m1&sessionId=S9"
        );
    }

    #[test]
    fn test_fresh_private_host() {
        let config = SessionConfig::host_private("p1", "duel", 2);
        assert_eq!(
            connection_url(WS, &config).unwrap(),
            "ws://relay.test/ws?sessionType=duel&targetNumMembers=2&private=true"
        );
    }

    #[test]
    fn test_fresh_public_without_size() {
        let config = SessionConfig::random("p1", "duel", 0);
        assert_eq!(
            connection_url(WS, &config).unwrap(),
            "ws://relay.test/ws?sessionType=duel"
        );
    }

    #[test]
    fn test_join_existing_session_sends_only_session_id() {
        let mut config = SessionConfig::join_private("p2", "duel", "ABCD");
        config.num_members = 4;
        assert_eq!(
            connection_url(WS, &config).unwrap(),
            "ws://relay.test/ws?sessionId=ABCD&sessionType=duel"
        );
    }

    #[test]
    fn test_values_are_url_encoded() {
        let config = SessionConfig::random("p1", "team game&x", 0);
        assert_eq!(
            connection_url(WS, &config).unwrap(),
            "ws://relay.test/ws?sessionType=team+game%26x"
        );
    }

    #[test]
    fn test_http_endpoints() {
        assert_eq!(ping_url("http://relay.test/"), "http://relay.test/ping");
        assert_eq!(
            notify_disconnect_url("http://relay.test", "m 1/2"),
            "http://relay.test/notifyDisconnect/m%201%2F2"
        );
    }
}
