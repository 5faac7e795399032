use std::collections::BTreeMap;

use crate::protocol::StyleProperty;

/// Filters a computed-style list down to the properties that carry signal:
/// an allowlist of layout/visibility/affordance properties, minus entries
/// that merely restate a default.
///
/// The default table matches what a stock Chromium reports for an unstyled
/// element; it is configuration, not a universal constant, since defaults
/// shift between browser builds.
#[derive(Debug, Clone)]
pub struct StyleFilter {
    allowed: Vec<String>,
    defaults: Vec<(String, Vec<String>)>,
}

impl Default for StyleFilter {
    fn default() -> Self {
        Self {
            allowed: [
                "display",
                "visibility",
                "opacity",
                "position",
                "font-size",
                "cursor",
                "background",
                "background-color",
                "color",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            defaults: [
                ("position", &["static"][..]),
                ("color", &["rgb(0, 0, 0)"]),
                ("font-size", &["13.3333px"]),
                ("background-color", &["rgba(0, 0, 0, 0)"]),
                ("cursor", &["default", "auto"]),
                ("opacity", &["1"]),
                ("visibility", &["visible"]),
            ]
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect(),
        }
    }
}

impl StyleFilter {
    /// A filter with a caller-supplied default table, for browser builds
    /// whose computed defaults differ from the stock table.
    pub fn with_defaults(defaults: Vec<(String, Vec<String>)>) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    fn is_relevant(&self, name: &str) -> bool {
        self.allowed.iter().any(|a| a == name)
    }

    fn is_default(&self, name: &str, value: &str) -> bool {
        self.defaults
            .iter()
            .any(|(n, values)| n == name && values.iter().any(|v| v == value))
    }

    /// Keeps allowlisted properties whose value deviates from the default
    /// table. Filtering an already-filtered map is a no-op.
    pub fn filter(&self, computed: &[StyleProperty]) -> BTreeMap<String, String> {
        let mut kept = BTreeMap::new();
        for item in computed {
            if !self.is_relevant(&item.name) {
                continue;
            }
            if self.is_default(&item.name, &item.value) {
                continue;
            }
            kept.insert(item.name.clone(), item.value.clone());
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(name: &str, value: &str) -> StyleProperty {
        StyleProperty {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn keeps_only_allowlisted_deviations() {
        let filter = StyleFilter::default();
        let computed = vec![
            prop("display", "flex"),
            prop("margin-top", "8px"),
            prop("color", "rgb(255, 0, 0)"),
            prop("position", "static"),
            prop("cursor", "pointer"),
        ];
        let kept = filter.filter(&computed);
        assert_eq!(kept.get("display").map(String::as_str), Some("flex"));
        assert_eq!(kept.get("color").map(String::as_str), Some("rgb(255, 0, 0)"));
        assert_eq!(kept.get("cursor").map(String::as_str), Some("pointer"));
        assert!(!kept.contains_key("margin-top"));
        assert!(!kept.contains_key("position"));
    }

    #[test]
    fn suppresses_every_default() {
        let filter = StyleFilter::default();
        let computed = vec![
            prop("position", "static"),
            prop("color", "rgb(0, 0, 0)"),
            prop("font-size", "13.3333px"),
            prop("background-color", "rgba(0, 0, 0, 0)"),
            prop("cursor", "default"),
            prop("cursor", "auto"),
            prop("opacity", "1"),
            prop("visibility", "visible"),
        ];
        assert!(filter.filter(&computed).is_empty());
    }

    #[test]
    fn filtering_is_idempotent() {
        let filter = StyleFilter::default();
        let computed = vec![
            prop("display", "none"),
            prop("opacity", "0.5"),
            prop("background", "red"),
        ];
        let once = filter.filter(&computed);
        let again: Vec<StyleProperty> = once
            .iter()
            .map(|(name, value)| prop(name, value))
            .collect();
        assert_eq!(filter.filter(&again), once);
    }

    #[test]
    fn custom_default_table_overrides_stock() {
        let filter = StyleFilter::with_defaults(vec![(
            "font-size".to_string(),
            vec!["16px".to_string()],
        )]);
        let kept = filter.filter(&[prop("font-size", "16px"), prop("position", "static")]);
        assert!(!kept.contains_key("font-size"));
        // stock default no longer applies
        assert_eq!(kept.get("position").map(String::as_str), Some("static"));
    }
}
