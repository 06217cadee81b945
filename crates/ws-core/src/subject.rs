use crate::error::WsError;

/// Event segments a Kafka subject's fourth component must be one of (§6).
pub const VALID_EVENTS: &[&str] = &[
    "trade",
    "liquidity",
    "metadata",
    "social",
    "favorites",
    "creation",
    "analytics",
    "balances",
];

/// A decoded Kafka subject: `odin.<type>.<symbol>.<event>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// The token/market type segment, e.g. `"token"`.
    pub r#type: String,
    /// The market symbol, e.g. `"BTC"`.
    pub symbol: String,
    /// The event kind, one of [`VALID_EVENTS`].
    pub event: String,
}

impl Subject {
    /// The subscription channel string derived from this subject:
    /// `<symbol>.<event>` (§3).
    #[must_use]
    pub fn channel(&self) -> String {
        format!("{}.{}", self.symbol, self.event)
    }
}

/// Parse a Kafka topic into its `Subject`, rejecting anything that doesn't
/// match the strict 4-part `odin.<type>.<symbol>.<event>` grammar or whose
/// event segment isn't in [`VALID_EVENTS`] (§4.3 step 2).
pub fn parse_subject(topic: &str) -> Result<Subject, WsError> {
    let parts: Vec<&str> = topic.split('.').collect();
    let [prefix, r#type, symbol, event] = parts.as_slice() else {
        return Err(WsError::ProtocolViolation(format!(
            "malformed subject `{topic}`: expected 4 dot-separated segments"
        )));
    };

    if *prefix != "odin" {
        return Err(WsError::ProtocolViolation(format!(
            "malformed subject `{topic}`: expected `odin` prefix"
        )));
    }
    if !VALID_EVENTS.contains(event) {
        return Err(WsError::ProtocolViolation(format!(
            "malformed subject `{topic}`: unknown event `{event}`"
        )));
    }
    if r#type.is_empty() || symbol.is_empty() {
        return Err(WsError::ProtocolViolation(format!(
            "malformed subject `{topic}`: empty type or symbol segment"
        )));
    }

    Ok(Subject {
        r#type: (*r#type).to_string(),
        symbol: (*symbol).to_string(),
        event: (*event).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_subject() {
        let subject = parse_subject("odin.token.BTC.trade").unwrap();
        assert_eq!(subject.r#type, "token");
        assert_eq!(subject.symbol, "BTC");
        assert_eq!(subject.event, "trade");
        assert_eq!(subject.channel(), "BTC.trade");
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(parse_subject("odin.token.BTC").is_err());
        assert!(parse_subject("odin.token.BTC.trade.extra").is_err());
    }

    #[test]
    fn rejects_unknown_event() {
        assert!(parse_subject("odin.token.BTC.not_an_event").is_err());
    }

    #[test]
    fn rejects_non_odin_prefix() {
        assert!(parse_subject("other.token.BTC.trade").is_err());
    }
}
