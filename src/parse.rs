//! Heuristics that pull a merchant name and a total out of noisy OCR lines.

use crate::types::{Amount, RecognizedText};
use once_cell::sync::Lazy;
use regex::Regex;

pub const UNKNOWN_MERCHANT: &str = "Unknown Merchant";

/// Words that mark a line as carrying the amount actually paid.
const TOTAL_KEYWORDS: &[&str] = &[
    "total",
    "amount",
    "balance",
    "due",
    "paid",
    "subtotal",
    "grand total",
];

static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{2,}").expect("valid regex"));

/// Optional currency symbol, thousands optionally comma-grouped, exactly two decimals.
static CURRENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[$€£¥]?\s*[0-9]{1,3}(?:,?[0-9]{3})*\.[0-9]{2}").expect("valid regex")
});

/// Best currency-like value found in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountMatch {
    pub amount: Amount,
    /// Whether the line it came from contains a total keyword.
    pub keyworded: bool,
    pub line_index: usize,
}

/// First line that looks like a store name: 4-49 chars, no digit runs, starts upper-case.
pub fn parse_merchant(text: &RecognizedText) -> String {
    let lines = text.lines();
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| looks_like_merchant(l))
        .or_else(|| lines.iter().map(|l| l.trim()).find(|l| !l.is_empty()))
        .unwrap_or(UNKNOWN_MERCHANT)
        .to_string()
}

fn looks_like_merchant(line: &str) -> bool {
    let len = line.chars().count();
    len > 3
        && len < 50
        && !DIGIT_RUN.is_match(line)
        && line.chars().next().is_some_and(|c| c.is_uppercase())
}

pub fn parse_amount(text: &RecognizedText) -> Option<Amount> {
    scan_amount(text).map(|m| m.amount)
}

/// Keyworded lines beat the rest; within a tier the largest value wins and
/// ties keep the earliest match.
pub fn scan_amount(text: &RecognizedText) -> Option<AmountMatch> {
    let mut best: Option<AmountMatch> = None;
    for (line_index, line) in text.lines().iter().enumerate() {
        let lower = line.to_lowercase();
        let keyworded = TOTAL_KEYWORDS.iter().any(|k| lower.contains(k));
        for m in CURRENCY.find_iter(&lower) {
            let Some(amount) = Amount::parse_decimal(m.as_str()) else {
                continue;
            };
            let candidate = AmountMatch {
                amount,
                keyworded,
                line_index,
            };
            let better = match &best {
                None => true,
                Some(current) => {
                    (candidate.keyworded, candidate.amount) > (current.keyworded, current.amount)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(lines: &[&str]) -> RecognizedText {
        lines.iter().copied().collect()
    }

    #[test]
    fn merchant_skips_dates_and_picks_capitalized_line() {
        let t = text(&["2024-01-05", "SUPERMART INC", "MILK 2 3.50"]);
        assert_eq!(parse_merchant(&t), "SUPERMART INC");
    }

    #[test]
    fn merchant_length_bounds_are_exclusive() {
        let long = "A".repeat(50);
        let t = text(&["ABC", long.as_str(), "Cafe Nero"]);
        assert_eq!(parse_merchant(&t), "Cafe Nero");

        let t = text(&["ABCD"]);
        assert_eq!(parse_merchant(&t), "ABCD");
    }

    #[test]
    fn merchant_of_49_chars_is_accepted() {
        let longest = format!("B{}", "a".repeat(48));
        assert_eq!(longest.chars().count(), 49);
        let t = text(&["", longest.as_str(), "Cafe Nero"]);
        assert_eq!(parse_merchant(&t), longest);
    }

    #[test]
    fn merchant_falls_back_to_first_non_empty_line() {
        let t = text(&["", "   ", "receipt #1234", "lowercase shop"]);
        assert_eq!(parse_merchant(&t), "receipt #1234");
    }

    #[test]
    fn merchant_sentinel_when_text_is_blank() {
        assert_eq!(parse_merchant(&text(&["", "  "])), UNKNOWN_MERCHANT);
        assert_eq!(parse_merchant(&RecognizedText::default()), UNKNOWN_MERCHANT);
    }

    #[test]
    fn merchant_accepts_non_latin_uppercase() {
        let t = text(&["12/03/2024", "Ünlü Market"]);
        assert_eq!(parse_merchant(&t), "Ünlü Market");
    }

    #[test]
    fn keyworded_total_is_chosen() {
        let t = text(&["subtotal 10.00", "tax 1.00", "total 11.00"]);
        assert_eq!(parse_amount(&t), Some(Amount::from_cents(1_100)));
        assert!(scan_amount(&t).unwrap().keyworded);
    }

    #[test]
    fn keyword_beats_larger_unkeyworded_value() {
        let t = text(&["TV 999.99", "Amount Due $ 45.10", "Change 954.89"]);
        let m = scan_amount(&t).unwrap();
        assert_eq!(m.amount, Amount::from_cents(4_510));
        assert_eq!(m.line_index, 1);
    }

    #[test]
    fn largest_wins_without_keywords() {
        let t = text(&["item 3.25", "item 45.00", "item 2.10"]);
        let m = scan_amount(&t).unwrap();
        assert_eq!(m.amount, Amount::from_cents(4_500));
        assert!(!m.keyworded);
    }

    #[test]
    fn ties_keep_first_match() {
        let t = text(&["TOTAL 20.00", "PAID 20.00"]);
        assert_eq!(scan_amount(&t).unwrap().line_index, 0);
    }

    #[test]
    fn grouped_thousands_and_symbols_parse() {
        let t = text(&["GRAND TOTAL $1,234.50"]);
        assert_eq!(parse_amount(&t), Some(Amount::from_cents(123_450)));
        let t = text(&["Total €12345.67"]);
        assert_eq!(parse_amount(&t), Some(Amount::from_cents(1_234_567)));
    }

    #[test]
    fn no_currency_like_text_is_absent() {
        let t = text(&["THANK YOU", "VISIT AGAIN", "2024-01-05", "qty 3"]);
        assert_eq!(parse_amount(&t), None);
        assert_eq!(parse_amount(&RecognizedText::default()), None);
    }
}
