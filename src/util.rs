//! Shared helpers for the paygate service.

use chrono::{DateTime, Months, Utc};

/// Advance a unix timestamp by one calendar month (the standard billing
/// period for the mobile-money networks, which have no native recurrence).
///
/// Falls back to 30 days if the timestamp is out of chrono's range.
pub fn one_month_after(ts: i64) -> i64 {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .and_then(|dt| dt.checked_add_months(Months::new(1)))
        .map(|dt| dt.timestamp())
        .unwrap_or(ts + 30 * 86400)
}

/// Mask a phone number for display: keep the first four and last two digits.
pub fn mask_phone(phone: &str) -> String {
    if phone.len() < 7 {
        return phone.to_string();
    }
    format!("{}****{}", &phone[..4], &phone[phone.len() - 2..])
}

/// Detect a card brand from its (possibly masked) number.
/// Recognizes the regional Humo/UzCard prefixes alongside the global brands.
pub fn detect_card_brand(number: &str) -> &'static str {
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.starts_with('4') {
        "Visa"
    } else if matches!(digits.get(..2), Some("51" | "52" | "53" | "54" | "55")) {
        "Mastercard"
    } else if digits.starts_with("9860") {
        "Humo"
    } else if digits.starts_with("8600") {
        "UzCard"
    } else {
        "Unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_phone_keeping_prefix_and_suffix() {
        assert_eq!(mask_phone("998901234567"), "9989****67");
        // Too short to mask meaningfully
        assert_eq!(mask_phone("12345"), "12345");
    }

    #[test]
    fn detects_card_brands() {
        assert_eq!(detect_card_brand("4111 1111 1111 1111"), "Visa");
        assert_eq!(detect_card_brand("5500000000000004"), "Mastercard");
        assert_eq!(detect_card_brand("9860120112345678"), "Humo");
        assert_eq!(detect_card_brand("8600312312345678"), "UzCard");
        assert_eq!(detect_card_brand("6011000000000000"), "Unknown");
    }

    #[test]
    fn one_month_crosses_year_boundary() {
        // 2023-12-15 00:00:00 UTC
        let dec = 1702598400;
        let jan = one_month_after(dec);
        assert_eq!(jan - dec, 31 * 86400);
    }
}
