// Ready-made hierarchies

use super::{DrillHierarchy, DrillHierarchyLevel};

/// Build a hierarchy from `(column, label)` pairs, outermost level first
pub fn create_hierarchy_from_columns(
    id: impl Into<String>,
    name: impl Into<String>,
    columns: &[(&str, &str)],
) -> DrillHierarchy {
    DrillHierarchy {
        id: id.into(),
        name: name.into(),
        description: None,
        levels: columns
            .iter()
            .map(|(column, label)| DrillHierarchyLevel::new(*column, *label))
            .collect(),
        default_level: 0,
    }
}

/// Hierarchies most dashboards need: time, geography, product and organisation
pub fn get_common_hierarchies() -> Vec<DrillHierarchy> {
    let mut time = create_hierarchy_from_columns(
        "time",
        "Time",
        &[
            ("year", "Year"),
            ("quarter", "Quarter"),
            ("month", "Month"),
            ("day", "Day"),
        ],
    );
    time.description = Some("Year > Quarter > Month > Day".to_string());
    time.levels[1] = DrillHierarchyLevel::new("quarter", "Quarter").with_format("Q{value}");

    let mut geography = create_hierarchy_from_columns(
        "geography",
        "Geography",
        &[
            ("country", "Country"),
            ("region", "Region"),
            ("state", "State"),
            ("city", "City"),
        ],
    );
    geography.description = Some("Country > Region > State > City".to_string());

    let mut product = create_hierarchy_from_columns(
        "product",
        "Product",
        &[
            ("category", "Category"),
            ("subcategory", "Subcategory"),
            ("product", "Product"),
        ],
    );
    product.description = Some("Category > Subcategory > Product".to_string());

    let mut organisation = create_hierarchy_from_columns(
        "organisation",
        "Organisation",
        &[
            ("division", "Division"),
            ("department", "Department"),
            ("team", "Team"),
        ],
    );
    organisation.description = Some("Division > Department > Team".to_string());

    vec![time, geography, product, organisation]
}
