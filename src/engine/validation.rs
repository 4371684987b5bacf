// Modem Manager Core - Validation
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Input checks for SMS and USSD, and folding of multipart messages.

use std::collections::HashSet;

use super::backend::UssdRequestKind;
use super::device::SmsMessage;

/// Longest USSD string accepted as a response.
pub const USSD_MAX_LENGTH: usize = 160;

/// Parts of one message arrive within this many seconds.
const MERGE_WINDOW_SECS: i64 = 5;

/// Whether `number` is an optional `+` followed by 3 to 20 digits.
pub fn validate_sms_number(number: &str) -> bool {
    let digits = number.strip_prefix('+').unwrap_or(number);
    (3..=20).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Classify a USSD string typed by the user.
pub fn classify_ussd(request: &str) -> UssdRequestKind {
    let length = request.chars().count();
    let is_code = length > 2
        && (request.starts_with('*') || request.starts_with('#'))
        && request.ends_with('#')
        && request.chars().all(|c| c.is_ascii_digit() || c == '*' || c == '#');

    if is_code {
        UssdRequestKind::Request
    } else if (1..=USSD_MAX_LENGTH).contains(&length) {
        UssdRequestKind::Response
    } else {
        UssdRequestKind::Invalid
    }
}

fn same_message(a: &SmsMessage, b: &SmsMessage) -> bool {
    a.number == b.number && a.binary == b.binary && (a.timestamp - b.timestamp).abs() <= MERGE_WINDOW_SECS
}

/// Fold message parts sent by the same number within a few seconds.
///
/// Parts are folded in backend index order into the first part, whose
/// identifiers and text grow accordingly. The result is ordered by
/// timestamp.
pub fn merge_sms(mut messages: Vec<SmsMessage>) -> Vec<SmsMessage> {
    if messages.len() <= 1 {
        return messages;
    }

    messages.sort_by_key(SmsMessage::first_ident);

    let mut folded: HashSet<usize> = HashSet::new();
    for target in 0..messages.len() {
        if folded.contains(&target) {
            continue;
        }
        for source in 0..messages.len() {
            if source == target || folded.contains(&source) {
                continue;
            }
            if !same_message(&messages[target], &messages[source]) {
                continue;
            }
            let (idents, text) = (messages[source].idents.clone(), messages[source].text.clone());
            let survivor = &mut messages[target];
            survivor.idents.extend(idents);
            if survivor.text.is_empty() {
                survivor.text = text;
            } else {
                survivor.text.push(' ');
                survivor.text.push_str(&text);
            }
            folded.insert(source);
        }
    }

    let mut merged: Vec<SmsMessage> = messages
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !folded.contains(i))
        .map(|(_, m)| m)
        .collect();
    merged.sort_by_key(|m| m.timestamp);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn part(ident: u32, number: &str, text: &str, timestamp: i64) -> SmsMessage {
        SmsMessage {
            number: number.to_string(),
            idents: vec![ident],
            text: text.to_string(),
            timestamp,
            ..SmsMessage::default()
        }
    }

    #[test]
    fn test_sms_numbers() {
        assert!(validate_sms_number("12345"));
        assert!(validate_sms_number("+79161234567"));
        assert!(validate_sms_number("900"));
        assert!(!validate_sms_number("12"));
        assert!(!validate_sms_number("abc123"));
        assert!(!validate_sms_number("+"));
        assert!(!validate_sms_number("12+345"));
        assert!(!validate_sms_number("++12345"));
        assert!(!validate_sms_number("123456789012345678901"));
        assert!(validate_sms_number("+12345678901234567890"));
    }

    #[test]
    fn test_ussd_classes() {
        assert_eq!(classify_ussd("*100#"), UssdRequestKind::Request);
        assert_eq!(classify_ussd("#102#"), UssdRequestKind::Request);
        assert_eq!(classify_ussd("hello"), UssdRequestKind::Response);
        assert_eq!(classify_ussd("1"), UssdRequestKind::Response);
        assert_eq!(classify_ussd("*#"), UssdRequestKind::Response);
        assert_eq!(classify_ussd("*100"), UssdRequestKind::Response);
        assert_eq!(classify_ussd(""), UssdRequestKind::Invalid);
        assert_eq!(classify_ussd(&"1".repeat(161)), UssdRequestKind::Invalid);
        assert_eq!(classify_ussd(&"1".repeat(160)), UssdRequestKind::Response);
    }

    #[test]
    fn test_merge_folds_parts() {
        let messages = vec![
            part(2, "+100", "world", 1003),
            part(1, "+100", "hello", 1000),
            part(3, "+200", "other", 1001),
            part(4, "+100", "later", 2000),
        ];
        let merged = merge_sms(messages);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].text, "hello world");
        assert_eq!(merged[0].idents, vec![1, 2]);
        assert_eq!(merged[1].number, "+200");
        assert_eq!(merged[2].text, "later");
    }

    #[test]
    fn test_merge_respects_binary_flag() {
        let mut binary = part(2, "+100", "data", 1001);
        binary.binary = true;
        let merged = merge_sms(vec![part(1, "+100", "text", 1000), binary]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_keeps_single_message() {
        let merged = merge_sms(vec![part(9, "+1", "only", 5)]);
        assert_eq!(merged, vec![part(9, "+1", "only", 5)]);
    }

    #[test]
    fn test_merge_orders_by_timestamp() {
        let merged = merge_sms(vec![part(1, "+1", "b", 300), part(2, "+2", "a", 100)]);
        let stamps: Vec<i64> = merged.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![100, 300]);
    }

    fn arb_part() -> impl Strategy<Value = SmsMessage> {
        (0u32..40, prop::sample::select(vec!["+1", "+2"]), 0i64..30, any::<bool>()).prop_map(
            |(ident, number, timestamp, binary)| SmsMessage {
                binary,
                ..part(ident, number, "x", timestamp)
            },
        )
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(parts in prop::collection::vec(arb_part(), 0..12)) {
            let once = merge_sms(parts);
            let twice = merge_sms(once.clone());
            prop_assert!(once.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_keeps_every_ident(parts in prop::collection::vec(arb_part(), 0..12)) {
            let mut before: Vec<u32> = parts.iter().flat_map(|m| m.idents.clone()).collect();
            let mut after: Vec<u32> = merge_sms(parts).iter().flat_map(|m| m.idents.clone()).collect();
            before.sort_unstable();
            after.sort_unstable();
            prop_assert_eq!(before, after);
        }

        #[test]
        fn prop_valid_numbers_accepted(digits in "[0-9]{3,20}", plus in any::<bool>()) {
            let number = if plus { format!("+{}", digits) } else { digits };
            prop_assert!(validate_sms_number(&number));
        }
    }
}
