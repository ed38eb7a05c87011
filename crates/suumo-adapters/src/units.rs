//! Text, yen and area parsing for SUUMO listing cards.

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Square metres per 坪.
pub const SQM_PER_TSUBO: f64 = 3.305785;

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid literal regex"))
}

fn number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok()
}

/// NFKC-normalizes (full-width digits, `㎡` and `m²` become ASCII) and collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text.nfkc().collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses one yen amount such as `1億2000万円`, `9.8万円` or `5000円`.
pub fn parse_jpy_amount(token: &str) -> Option<f64> {
    static OKU: OnceLock<Regex> = OnceLock::new();
    static OKU_MAN: OnceLock<Regex> = OnceLock::new();
    static MAN: OnceLock<Regex> = OnceLock::new();
    static YEN: OnceLock<Regex> = OnceLock::new();

    let text = normalize_text(token).replace(',', "");
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = cached(&OKU, r"(\d+(?:\.\d+)?)\s*億").captures(&text) {
        let oku = number(&caps[1])?;
        let man = cached(&OKU_MAN, r"億\s*(\d+(?:\.\d+)?)\s*万")
            .captures(&text)
            .and_then(|c| number(&c[1]))
            .unwrap_or(0.0);
        return Some(oku * 100_000_000.0 + man * 10_000.0);
    }
    if let Some(caps) = cached(&MAN, r"(\d+(?:\.\d+)?)\s*万").captures(&text) {
        return number(&caps[1]).map(|man| man * 10_000.0);
    }
    cached(&YEN, r"(\d+(?:\.\d+)?)\s*円")
        .captures(&text)
        .and_then(|caps| number(&caps[1]))
}

/// First yen token in free text, e.g. `9.8万` out of `9.8万円 5000円`.
pub fn first_amount_token(text: &str) -> Option<String> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    cached(&TOKEN, r"\d+(?:\.\d+)?\s*(?:億\d+(?:\.\d+)?万|億|万|円)")
        .find(text)
        .map(|m| normalize_text(m.as_str()))
}

/// Price in yen. Ranges (`~`, `〜`, `～`) are averaged; otherwise the largest amount wins.
pub fn extract_price_yen(price_text: &str) -> Option<f64> {
    static RANGE: OnceLock<Regex> = OnceLock::new();
    static TOKEN: OnceLock<Regex> = OnceLock::new();

    let text = normalize_text(price_text).replace(',', "");
    if text.is_empty() {
        return None;
    }

    let parts: Vec<f64> = cached(&RANGE, r"[~〜～]")
        .split(&text)
        .filter_map(parse_jpy_amount)
        .collect();
    if !parts.is_empty() {
        return Some(parts.iter().sum::<f64>() / parts.len() as f64);
    }

    cached(&TOKEN, r"\d+(?:\.\d+)?\s*(?:億\d+(?:\.\d+)?万|億|万|円)")
        .find_iter(&text)
        .filter_map(|m| parse_jpy_amount(m.as_str()))
        .reduce(f64::max)
}

fn average_of(pattern: &Regex, text: &str) -> Option<f64> {
    let values: Vec<f64> = pattern
        .captures_iter(text)
        .filter_map(|caps| number(&caps[1]))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Area in m²; several figures (ranges) are averaged.
pub fn extract_area_sqm(area_text: &str) -> Option<f64> {
    static SQM: OnceLock<Regex> = OnceLock::new();
    let text = normalize_text(area_text).replace(',', "");
    average_of(cached(&SQM, r"(\d+(?:\.\d+)?)\s*m\s*2"), &text)
}

/// Area in 坪, taken from the text when stated, else derived from m².
pub fn extract_area_tsubo(area_text: &str) -> Option<f64> {
    static TSUBO: OnceLock<Regex> = OnceLock::new();
    let text = normalize_text(area_text).replace(',', "");
    average_of(cached(&TSUBO, r"(\d+(?:\.\d+)?)\s*坪"), &text)
        .or_else(|| extract_area_sqm(&text).map(|sqm| sqm / SQM_PER_TSUBO))
}

/// `price / area`, only for a positive area.
pub fn unit_price(price_yen: Option<f64>, area: Option<f64>) -> Option<f64> {
    match (price_yen, area) {
        (Some(price), Some(area)) if area > 0.0 => Some(price / area),
        _ => None,
    }
}
