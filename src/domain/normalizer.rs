//! Pure string normalization for product names, specifications, and
//! manufacturers.
//!
//! Everything in here is deterministic and idempotent: `normalize_name`
//! applied to its own output is a no-op. The identity tuple derived from the
//! normalized fields is what the drug repository enforces uniqueness on.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{CrawlError, CrawlResult};

/// Promotional prefixes the upstream decorates listing names with.
const PROMO_PREFIXES: &[&str] = &[
    "特价", "限时", "秒杀", "促销", "热卖", "爆款", "新品", "推荐",
];

static FREE_SHIPPING_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+免邮\s*").unwrap());
static BRACKET_TAG_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[[^\]]*\]\s*").unwrap());
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
// Keeps CJK, alphanumerics, whitespace, parens, and the characters that carry
// pack structure: * - . %
static NAME_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^一-龥a-zA-Z0-9\s()\-.*%]").unwrap());
static MULTIPLY_SIGNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[×xX]").unwrap());
static UNIT_ML: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ml|毫升").unwrap());
static UNIT_MG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)mg|毫克").unwrap());
static LONE_LOWER_L: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|[^m])l").unwrap());

/// Fold full-width characters (and the ideographic space) to their ASCII
/// counterparts.
fn fold_width(input: &str) -> String {
    input
        .chars()
        .map(|c| match c as u32 {
            0x3000 => ' ',
            0xFF01..=0xFF5E => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            _ => c,
        })
        .collect()
}

/// Strip one layer of promotional decoration. Returns None when nothing was
/// stripped, so the caller can iterate to a fixpoint.
fn strip_promo_once(name: &str) -> Option<String> {
    if let Some(pos) = name.find("包邮") {
        let tail = name[pos + "包邮".len()..].trim_start();
        return Some(tail.to_string());
    }
    if let Some(m) = FREE_SHIPPING_PREFIX.find(name) {
        return Some(name[m.end()..].to_string());
    }
    if let Some(m) = BRACKET_TAG_PREFIX.find(name) {
        return Some(name[m.end()..].to_string());
    }
    for prefix in PROMO_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            return Some(rest.trim_start().to_string());
        }
    }
    None
}

/// Normalize a display name: width folding, promo stripping, whitespace
/// collapse, noise removal. Trailing markers such as `(RX)` survive because
/// they inform classification.
pub fn normalize_name(name: &str) -> String {
    let mut name = fold_width(name.trim());

    // Promo decorations can nest ("特价 [促销] ..."); strip to a fixpoint so
    // normalizing twice is a no-op.
    loop {
        let trimmed = name.trim().to_string();
        match strip_promo_once(&trimmed) {
            Some(stripped) => name = stripped,
            None => {
                name = trimmed;
                break;
            }
        }
    }

    let name = NAME_NOISE.replace_all(&name, "");
    let name = WHITESPACE_RUN.replace_all(name.trim(), " ");
    name.into_owned()
}

/// Normalize a packaging specification: canonical units {mg, g, ml, L}, a
/// single `*` as the pack multiplier, no internal whitespace.
pub fn normalize_specification(spec: &str) -> String {
    let spec = fold_width(spec.trim());
    let spec = MULTIPLY_SIGNS.replace_all(&spec, "*");
    let spec = UNIT_ML.replace_all(&spec, "ml");
    let spec = UNIT_MG.replace_all(&spec, "mg");
    let spec = spec.replace('克', "g").replace('升', "L").replace('G', "g");
    let spec = LONE_LOWER_L.replace_all(&spec, "${1}L");
    WHITESPACE_RUN.replace_all(&spec, "").into_owned()
}

/// Manufacturers get the same width/whitespace/noise treatment as names but
/// no promo stripping (suppliers do not decorate factory names).
pub fn normalize_manufacturer(manufacturer: &str) -> String {
    let folded = fold_width(manufacturer.trim());
    let cleaned = NAME_NOISE.replace_all(&folded, "");
    WHITESPACE_RUN.replace_all(cleaned.trim(), " ").into_owned()
}

/// The drug identity tuple. Uniqueness in storage is enforced on exactly
/// these three normalized fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub name: String,
    pub specification: String,
    pub manufacturer: String,
}

/// Derive the identity tuple for an observed offer. Fails only when the name
/// normalizes to nothing; such records are dropped with a warning upstream.
pub fn identity_key(name: &str, spec: &str, manufacturer: &str) -> CrawlResult<IdentityKey> {
    let name = normalize_name(name);
    if name.is_empty() {
        return Err(CrawlError::Normalization(format!(
            "name {name:?} is empty after cleanup"
        )));
    }
    Ok(IdentityKey {
        name,
        specification: normalize_specification(spec),
        manufacturer: normalize_manufacturer(manufacturer),
    })
}

/// Casefolded, whitespace-free containment check used to keep only offers
/// relevant to the search keyword. Falls back to the keyword's first three
/// characters the way the upstream's own search behaves for long keywords.
pub fn name_matches_keyword(name: &str, keyword: &str) -> bool {
    let name = normalize_name(name).to_lowercase().replace(' ', "");
    let keyword = normalize_name(keyword).to_lowercase().replace(' ', "");
    if keyword.is_empty() {
        return false;
    }
    if name.contains(&keyword) {
        return true;
    }
    let prefix: String = keyword.chars().take(3).collect();
    keyword.chars().count() > 3 && name.contains(&prefix)
}

/// Parse an upstream price string ("¥650.50", "650.5", "650") into integer
/// cents. Decimal digits beyond two are truncated, matching the upstream's
/// own two-decimal rendering.
pub fn parse_price_cents(raw: &str) -> Option<i64> {
    let cleaned = raw.trim().trim_start_matches(['¥', '￥']).trim();
    if cleaned.is_empty() {
        return None;
    }
    let (whole, frac) = match cleaned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (cleaned, ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let frac_digits: String = frac.chars().take(2).collect();
    let frac_cents = match frac_digits.len() {
        0 => 0,
        1 => frac_digits.parse::<i64>().ok()? * 10,
        _ => frac_digits.parse::<i64>().ok()?,
    };
    if !frac.is_empty() && frac.chars().any(|c| !c.is_ascii_digit()) {
        return None;
    }
    Some(whole * 100 + frac_cents)
}

/// Render cents back to a two-decimal string for the HTTP boundary.
pub fn format_price_yuan(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_shipping_and_promo_prefixes() {
        assert_eq!(normalize_name("1盒包邮 片仔癀3g*1粒(RX)"), "片仔癀3g*1粒(RX)");
        assert_eq!(normalize_name("2免邮 阿莫西林胶囊"), "阿莫西林胶囊");
        assert_eq!(normalize_name("[特价] 布洛芬缓释胶囊"), "布洛芬缓释胶囊");
        assert_eq!(normalize_name("秒杀 维生素C片"), "维生素C片");
    }

    #[test]
    fn nested_promo_prefixes_strip_to_fixpoint() {
        assert_eq!(normalize_name("促销特价阿莫西林"), "阿莫西林");
        assert_eq!(normalize_name("[促销] 特价 阿莫西林"), "阿莫西林");
    }

    #[test]
    fn folds_full_width_and_collapses_whitespace() {
        assert_eq!(normalize_name("片仔癀　３ｇ（ＲＸ）"), "片仔癀 3g(RX)");
        assert_eq!(normalize_name("  阿莫西林   胶囊  "), "阿莫西林 胶囊");
    }

    #[test]
    fn rx_marker_survives_cleanup() {
        assert_eq!(normalize_name("片仔癀 3g*1粒(RX)"), "片仔癀 3g*1粒(RX)");
    }

    #[test]
    fn specification_units_are_canonical() {
        assert_eq!(normalize_specification("3克×1粒"), "3g*1粒");
        assert_eq!(normalize_specification("100毫升"), "100ml");
        assert_eq!(normalize_specification("0.25G x 24片"), "0.25g*24片");
        assert_eq!(normalize_specification("250 毫克*12粒"), "250mg*12粒");
        assert_eq!(normalize_specification("1升"), "1L");
        assert_eq!(normalize_specification("10l"), "10L");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "1盒包邮 片仔癀3g*1粒(RX)",
            "促销特价阿莫西林",
            "片仔癀　３ｇ（ＲＸ）",
            "[新品]999感冒灵颗粒 10袋",
            "",
            "   ",
        ];
        for s in samples {
            let once = normalize_name(s);
            assert_eq!(normalize_name(&once), once, "name not idempotent for {s:?}");
        }
        let specs = ["3克×1粒", "100毫升", "0.25G x 24片", "250MG*12粒", "10l"];
        for s in specs {
            let once = normalize_specification(s);
            assert_eq!(
                normalize_specification(&once),
                once,
                "spec not idempotent for {s:?}"
            );
        }
    }

    #[test]
    fn identity_key_rejects_empty_names() {
        assert!(identity_key("", "3g*1粒", "厂家").is_err());
        assert!(identity_key("!!!", "", "").is_err());
        let key = identity_key("片仔癀 3g*1粒(RX)", "3克×1粒", " 漳州片仔癀药业 ").unwrap();
        assert_eq!(key.specification, "3g*1粒");
        assert_eq!(key.manufacturer, "漳州片仔癀药业");
    }

    #[test]
    fn keyword_matching_casefolds_and_ignores_spaces() {
        assert!(name_matches_keyword("阿莫西林 胶囊 0.25g", "阿莫西林"));
        assert!(name_matches_keyword("Vitamin C 咀嚼片", "vitamin c"));
        assert!(!name_matches_keyword("布洛芬缓释胶囊", "阿莫西林"));
        // Long keywords fall back to their leading characters.
        assert!(name_matches_keyword("天麻蜜环菌糖衣片", "天麻蜜环菌片"));
    }

    #[test]
    fn price_parsing() {
        assert_eq!(parse_price_cents("¥650.50"), Some(65050));
        assert_eq!(parse_price_cents("650.5"), Some(65050));
        assert_eq!(parse_price_cents("650"), Some(65000));
        assert_eq!(parse_price_cents("￥9999"), Some(999900));
        assert_eq!(parse_price_cents("0.01"), Some(1));
        assert_eq!(parse_price_cents(""), None);
        assert_eq!(parse_price_cents("abc"), None);
        assert_eq!(format_price_yuan(65050), "650.50");
        assert_eq!(format_price_yuan(100), "1.00");
    }
}
