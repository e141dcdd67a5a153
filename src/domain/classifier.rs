//! Product category assignment from name, manufacturer, and detail-page
//! signals.
//!
//! Pure rule cascade, first match wins. Provenance and a short reason are
//! recorded with every verdict so a later crawl with a stronger signal can
//! re-classify without losing the audit trail.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::entities::{CategorySource, ProductCategory};

/// Closed keyword lists. These mirror what actually shows up in upstream
/// listing names; extending them is a data change, not a code change.
const COSMETIC_KEYWORDS: &[&str] = &[
    "珍珠霜", "珍珠膏", "面霜", "乳液", "精华液", "洗面奶", "面膜", "眼霜",
    "护肤水", "化妆水", "皇后牌",
];

const DEVICE_KEYWORDS: &[&str] = &[
    "医用口罩", "外科口罩", "血糖仪", "血压计", "体温计", "雾化器", "注射器",
    "输液器", "绷带", "纱布",
];

const DOSAGE_FORMS: &[&str] = &[
    "片", "胶囊", "颗粒", "口服液", "注射液", "注射剂", "软膏", "乳膏", "贴剂",
    "滴眼液", "滴剂", "糖浆", "丸", "散", "栓剂", "喷雾剂", "混悬剂",
];

const HEALTH_MARKERS: &[&str] = &["保健", "营养"];
const HEALTH_PRODUCTS: &[&str] = &["维生素", "钙片", "鱼油", "蛋白粉", "益生菌"];

static APPROVAL_DRUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"国药准字[HZSJB]\d{8}").unwrap());
static APPROVAL_DEVICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"国械注[准进]").unwrap());
static APPROVAL_COSMETIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"卫妆准字|国妆特字").unwrap());
static APPROVAL_HEALTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"国食健字|卫食健字").unwrap());

/// All approval-number shapes the detail extractor recognizes, in match
/// priority order.
pub static APPROVAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"国药准字[HZSJB]\d{8}",
        r"国械注准\d+",
        r"国械注进\d+",
        r"卫妆准字\d+",
        r"国妆特字\d+",
        r"国食健字G?\d+",
        r"卫食健字\d+",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// A classification verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: ProductCategory,
    /// In [0, 1].
    pub confidence: f64,
    pub source: CategorySource,
    /// Which rule fired, e.g. "keyword:rx" or "dosage-form:片".
    pub reason: String,
}

impl Classification {
    fn new(
        category: ProductCategory,
        confidence: f64,
        source: CategorySource,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            category,
            confidence,
            source,
            reason: reason.into(),
        }
    }
}

/// Map a regulator-issued approval number prefix to a category. Returns None
/// for strings that match no known shape.
pub fn category_from_approval(approval: &str) -> Option<ProductCategory> {
    if APPROVAL_DRUG.is_match(approval) {
        Some(ProductCategory::Drug)
    } else if APPROVAL_DEVICE.is_match(approval) {
        Some(ProductCategory::MedicalDevice)
    } else if APPROVAL_COSMETIC.is_match(approval) {
        Some(ProductCategory::Cosmetic)
    } else if APPROVAL_HEALTH.is_match(approval) {
        Some(ProductCategory::HealthProduct)
    } else {
        None
    }
}

/// Classify a product. Rule order:
///
/// 1. `(RX)` / `(OTC)` marker in the name: prescription products are drugs,
///    full stop.
/// 2. Approval-number signal from the detail page, when available. This
///    outranks every name/manufacturer heuristic below.
/// 3. Manufacturer line of business (化妆品 / 医疗器械).
/// 4. High-confidence product keywords.
/// 5. Pharmaceutical dosage forms.
/// 6. Health-product markers combined with a product word.
/// 7. Default: drug at 0.50.
pub fn classify(
    name: &str,
    manufacturer: &str,
    approval_number: Option<&str>,
) -> Classification {
    let name_lower = name.to_lowercase();
    let mfr = manufacturer;

    if name_lower.contains("(rx)") || name_lower.contains("（rx）") {
        return Classification::new(ProductCategory::Drug, 1.0, CategorySource::Keyword, "keyword:rx");
    }
    if name_lower.contains("(otc)") || name_lower.contains("otc") {
        return Classification::new(ProductCategory::Drug, 1.0, CategorySource::Keyword, "keyword:otc");
    }

    if let Some(approval) = approval_number {
        if let Some(category) = category_from_approval(approval) {
            return Classification::new(
                category,
                1.0,
                CategorySource::Browser,
                format!("approval:{approval}"),
            );
        }
    }

    if mfr.contains("化妆品") {
        return Classification::new(
            ProductCategory::Cosmetic,
            0.95,
            CategorySource::Keyword,
            "manufacturer:化妆品",
        );
    }
    if mfr.contains("医疗器械") {
        return Classification::new(
            ProductCategory::MedicalDevice,
            0.95,
            CategorySource::Keyword,
            "manufacturer:医疗器械",
        );
    }

    for kw in COSMETIC_KEYWORDS {
        if name.contains(kw) {
            return Classification::new(
                ProductCategory::Cosmetic,
                0.90,
                CategorySource::Keyword,
                format!("keyword:{kw}"),
            );
        }
    }
    for kw in DEVICE_KEYWORDS {
        if name.contains(kw) {
            return Classification::new(
                ProductCategory::MedicalDevice,
                0.90,
                CategorySource::Keyword,
                format!("keyword:{kw}"),
            );
        }
    }

    for form in DOSAGE_FORMS {
        if name.contains(form) {
            return Classification::new(
                ProductCategory::Drug,
                0.85,
                CategorySource::Keyword,
                format!("dosage-form:{form}"),
            );
        }
    }

    let has_marker = HEALTH_MARKERS.iter().any(|m| name.contains(m));
    let has_product = HEALTH_PRODUCTS.iter().any(|p| name.contains(p));
    if has_marker && has_product {
        return Classification::new(
            ProductCategory::HealthProduct,
            0.80,
            CategorySource::Keyword,
            "health-marker",
        );
    }

    Classification::new(ProductCategory::Drug, 0.50, CategorySource::Default, "default")
}

/// Scan arbitrary text (rendered HTML, intercepted JSON) for the first
/// approval-number-shaped substring.
pub fn find_approval_number(text: &str) -> Option<String> {
    APPROVAL_PATTERNS
        .iter()
        .find_map(|re| re.find(text).map(|m| m.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_marker_wins_over_everything() {
        let c = classify("皇后牌珍珠霜(RX)", "某化妆品厂", Some("卫妆准字2201001"));
        assert_eq!(c.category, ProductCategory::Drug);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.source, CategorySource::Keyword);
        // Full-width parens from unnormalized input still count.
        let c = classify("片仔癀（RX）", "", None);
        assert_eq!(c.category, ProductCategory::Drug);
    }

    #[test]
    fn approval_number_overrides_name_heuristics() {
        let c = classify("皇后牌珍珠霜", "", Some("国药准字H12345678"));
        assert_eq!(c.category, ProductCategory::Drug);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.source, CategorySource::Browser);

        let c = classify("阿莫西林胶囊", "", Some("国械注准20193140528"));
        assert_eq!(c.category, ProductCategory::MedicalDevice);
    }

    #[test]
    fn approval_prefixes_map_to_all_four_categories() {
        assert_eq!(category_from_approval("国药准字Z20025324"), Some(ProductCategory::Drug));
        assert_eq!(category_from_approval("国械注进20203141234"), Some(ProductCategory::MedicalDevice));
        assert_eq!(category_from_approval("国妆特字G20210456"), Some(ProductCategory::Cosmetic));
        assert_eq!(category_from_approval("国食健字G20040123"), Some(ProductCategory::HealthProduct));
        assert_eq!(category_from_approval("QS12345"), None);
    }

    #[test]
    fn manufacturer_line_of_business() {
        let c = classify("某某霜", "上海某某化妆品有限公司", None);
        assert_eq!(c.category, ProductCategory::Cosmetic);
        assert_eq!(c.confidence, 0.95);

        let c = classify("某某仪", "深圳某某医疗器械有限公司", None);
        assert_eq!(c.category, ProductCategory::MedicalDevice);
    }

    #[test]
    fn keyword_lists() {
        let c = classify("皇后牌 片仔癀 珍珠霜 25g", "", None);
        assert_eq!(c.category, ProductCategory::Cosmetic);
        assert!(c.confidence >= 0.90);

        let c = classify("一次性医用口罩 50只", "", None);
        assert_eq!(c.category, ProductCategory::MedicalDevice);
        assert_eq!(c.confidence, 0.90);
    }

    #[test]
    fn dosage_forms_classify_as_drug() {
        for name in ["阿莫西林胶囊", "感冒灵颗粒", "小儿止咳糖浆", "地塞米松注射液"] {
            let c = classify(name, "", None);
            assert_eq!(c.category, ProductCategory::Drug, "for {name}");
            assert_eq!(c.confidence, 0.85);
        }
    }

    #[test]
    fn health_products_need_marker_and_product_word() {
        let c = classify("营养 鱼油软糖", "", None);
        assert_eq!(c.category, ProductCategory::HealthProduct);
        assert_eq!(c.confidence, 0.80);

        // A dosage form outranks the health marker: vitamin tablets are drugs.
        let c = classify("保健 维生素C片", "", None);
        assert_eq!(c.category, ProductCategory::Drug);

        // A product word without the marker falls through to dosage/default.
        let c = classify("鱼油软糖", "", None);
        assert_ne!(c.category, ProductCategory::HealthProduct);
    }

    #[test]
    fn default_is_low_confidence_drug() {
        let c = classify("不知名商品", "", None);
        assert_eq!(c.category, ProductCategory::Drug);
        assert_eq!(c.confidence, 0.50);
        assert_eq!(c.source, CategorySource::Default);
        assert_eq!(c.reason, "default");
    }

    #[test]
    fn classification_is_total_and_stable() {
        let inputs = [
            ("", ""),
            ("阿莫西林胶囊", "华北制药"),
            ("皇后牌珍珠霜", ""),
            ("xyz 123", "foreign co"),
        ];
        for (name, mfr) in inputs {
            let a = classify(name, mfr, None);
            let b = classify(name, mfr, None);
            assert!((0.0..=1.0).contains(&a.confidence));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn approval_scan_finds_first_match_in_text() {
        let html = "<div>批准文号：国药准字H20044605 有效期...</div>";
        assert_eq!(find_approval_number(html).as_deref(), Some("国药准字H20044605"));
        assert_eq!(find_approval_number("nothing here"), None);
    }
}
