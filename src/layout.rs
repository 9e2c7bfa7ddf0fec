//! Where source units live inside the repository.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const DEFAULT_SOURCE_ROOT: &str = "force-app/main/default/classes";
const DEFAULT_EXTENSION: &str = "cls";

/// Maximum length of an Apex class name.
const MAX_UNIT_NAME_LEN: usize = 255;

fn unit_name_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("unit name regex is valid")
    })
}

/// Maps a unit name (an Apex class name) to its path in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitLayout {
    pub source_root: String,
    pub extension: String,
}

impl Default for UnitLayout {
    fn default() -> Self {
        Self {
            source_root: DEFAULT_SOURCE_ROOT.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

impl UnitLayout {
    /// Repository-relative path of a unit, always `/`-separated.
    pub fn path_for(&self, unit: &str) -> String {
        let root = self.source_root.trim_matches('/');
        let ext = self.extension.trim_start_matches('.');
        if root.is_empty() {
            format!("{}.{}", unit, ext)
        } else {
            format!("{}/{}.{}", root, unit, ext)
        }
    }

    /// Trim whitespace and a trailing file extension off a requested name.
    pub fn normalize<'a>(&self, unit: &'a str) -> &'a str {
        let trimmed = unit.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
        let ext = self.extension.trim_start_matches('.');
        trimmed
            .strip_suffix(ext)
            .and_then(|rest| rest.strip_suffix('.'))
            .unwrap_or(trimmed)
    }
}

/// Unit names are bare identifiers; anything else could escape the source root.
pub fn is_valid_unit_name(name: &str) -> bool {
    name.len() <= MAX_UNIT_NAME_LEN && unit_name_regex().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_points_at_sfdx_classes() {
        let layout = UnitLayout::default();
        assert_eq!(
            layout.path_for("AccountService"),
            "force-app/main/default/classes/AccountService.cls"
        );
    }

    #[test]
    fn test_custom_layout_tolerates_slashes_and_dots() {
        let layout = UnitLayout {
            source_root: "/src/classes/".to_string(),
            extension: ".cls".to_string(),
        };
        assert_eq!(layout.path_for("Foo"), "src/classes/Foo.cls");

        let flat = UnitLayout {
            source_root: String::new(),
            extension: "cls".to_string(),
        };
        assert_eq!(flat.path_for("Foo"), "Foo.cls");
    }

    #[test]
    fn test_normalize_strips_extension_and_quotes() {
        let layout = UnitLayout::default();
        assert_eq!(layout.normalize(" Foo.cls "), "Foo");
        assert_eq!(layout.normalize("`Bar`"), "Bar");
        assert_eq!(layout.normalize("Baz"), "Baz");
        assert_eq!(layout.normalize("cls"), "cls");
    }

    #[test]
    fn test_unit_name_validation() {
        assert!(is_valid_unit_name("Foo"));
        assert!(is_valid_unit_name("Account_Selector2"));
        assert!(is_valid_unit_name("_Private"));
        assert!(!is_valid_unit_name(""));
        assert!(!is_valid_unit_name("2Fast"));
        assert!(!is_valid_unit_name("../etc/passwd"));
        assert!(!is_valid_unit_name("Foo Bar"));
        assert!(!is_valid_unit_name("Foo.cls"));
        assert!(!is_valid_unit_name(&"A".repeat(300)));
    }
}
