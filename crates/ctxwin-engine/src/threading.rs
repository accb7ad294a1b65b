//! Server-side threading eligibility.
//!
//! A context may reference its previous model output by continuation token
//! only when the live history could be reconstructed from that token alone:
//! no tool traffic, and every live model response carries a token.

use ctxwin_core::record::{Record, RecordKind};

/// Why a call falls back to sending the full history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ineligible {
    ToolTraffic,
    MissingToken,
    MixedTokens,
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolTraffic => write!(f, "live tool traffic"),
            Self::MissingToken => write!(f, "last model response has no continuation token"),
            Self::MixedTokens => write!(f, "model responses mix present and absent tokens"),
        }
    }
}

pub fn check(live: &[Record]) -> Result<(), Ineligible> {
    if live.iter().any(|r| r.kind.is_tool_traffic()) {
        return Err(Ineligible::ToolTraffic);
    }

    let responses: Vec<&Record> = live
        .iter()
        .filter(|r| r.kind == RecordKind::ModelResponse)
        .collect();

    if let Some(last) = responses.last() {
        if !last.has_continuation_token() {
            return Err(Ineligible::MissingToken);
        }
    }
    if responses.iter().any(|r| !r.has_continuation_token()) {
        return Err(Ineligible::MixedTokens);
    }
    Ok(())
}

pub fn is_eligible(live: &[Record]) -> bool {
    check(live).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ctxwin_core::ids::{ContextId, RecordId};

    fn rec(id: i64, kind: RecordKind, token: Option<&str>) -> Record {
        Record {
            id: RecordId::from_raw(id),
            context_id: ContextId::new(),
            timestamp: Utc::now(),
            kind,
            content: "x".into(),
            live: true,
            est_tokens: 1,
            continuation_token: token.map(String::from),
        }
    }

    #[test]
    fn prompt_response_prompt_is_eligible() {
        let live = vec![
            rec(1, RecordKind::Prompt, None),
            rec(2, RecordKind::ModelResponse, Some("T1")),
            rec(3, RecordKind::Prompt, None),
        ];
        assert!(is_eligible(&live));
    }

    #[test]
    fn tool_record_anywhere_is_ineligible() {
        for pos in 0..=3 {
            let mut live = vec![
                rec(1, RecordKind::Prompt, None),
                rec(2, RecordKind::ModelResponse, Some("T1")),
                rec(3, RecordKind::Prompt, None),
            ];
            live.insert(pos, rec(9, RecordKind::ToolCall, None));
            assert_eq!(check(&live), Err(Ineligible::ToolTraffic), "position {pos}");
        }
        let live = vec![rec(1, RecordKind::ToolOutput, None)];
        assert_eq!(check(&live), Err(Ineligible::ToolTraffic));
    }

    #[test]
    fn tokenless_then_tokened_is_mixed() {
        let live = vec![
            rec(1, RecordKind::ModelResponse, None),
            rec(2, RecordKind::ModelResponse, Some("T2")),
        ];
        assert_eq!(check(&live), Err(Ineligible::MixedTokens));
    }

    #[test]
    fn last_response_without_token_is_ineligible() {
        let live = vec![
            rec(1, RecordKind::Prompt, None),
            rec(2, RecordKind::ModelResponse, Some("")),
            rec(3, RecordKind::Prompt, None),
        ];
        assert_eq!(check(&live), Err(Ineligible::MissingToken));
    }

    #[test]
    fn no_responses_is_eligible() {
        let live = vec![
            rec(1, RecordKind::SystemPrompt, None),
            rec(2, RecordKind::Prompt, None),
        ];
        assert!(is_eligible(&live));
        assert!(is_eligible(&[]));
    }
}
