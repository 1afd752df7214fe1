//! Grouping of selected tests by catalog category for display.

use std::collections::BTreeMap;

use crate::model::TestCategory;

/// Category shown for tests that are no longer (or never were) in the
/// catalog.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Build a test-name -> category-name map from the catalog.
pub fn test_category_map(catalog: &[TestCategory]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for category in catalog {
        for test in &category.available_tests {
            map.insert(test.clone(), category.category_name.clone());
        }
    }
    map
}

/// Group a request's selected tests by category, preserving the selection
/// order within each group. Unknown tests land under [`UNCATEGORIZED`].
pub fn categorize_selected_tests(
    selected_tests: &[String],
    catalog: &[TestCategory],
) -> BTreeMap<String, Vec<String>> {
    let map = test_category_map(catalog);

    let mut categorized: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for test in selected_tests {
        let category = map
            .get(test)
            .cloned()
            .unwrap_or_else(|| UNCATEGORIZED.to_string());
        categorized.entry(category).or_default().push(test.clone());
    }
    categorized
}
