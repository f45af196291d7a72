use lumen_core::SqlDialect;
use lumen_query::drill::{
    create_hierarchy_from_columns, DrillDirection, DrillHierarchy, DrillPath, DrillRequest,
    DrillService,
};
use lumen_query::filter::{FilterCondition, FilterOperator, FilterService};
use lumen_query::mongo::like_to_regex;
use proptest::prelude::*;
use regex::Regex;
use serde_json::{json, Value};

fn hierarchy() -> DrillHierarchy {
    create_hierarchy_from_columns(
        "geo",
        "Geography",
        &[
            ("country", "Country"),
            ("region", "Region"),
            ("state", "State"),
            ("city", "City"),
        ],
    )
}

fn drill(
    service: &DrillService,
    path: DrillPath,
    direction: DrillDirection,
    value: Option<Value>,
) -> lumen_query::drill::DrillResponse {
    let request = DrillRequest {
        chart_id: "map".to_string(),
        hierarchy_id: "geo".to_string(),
        direction,
        clicked_value: value,
        current_path: Some(path),
        base_query: "SELECT * FROM stores".to_string(),
        measure: None,
    };
    service.execute_drill(&hierarchy(), &request).unwrap()
}

/// Path reached by drilling down through `values`
fn path_through(service: &DrillService, values: &[String]) -> DrillPath {
    values.iter().fold(service.initial_path(&hierarchy()), |path, value| {
        drill(service, path, DrillDirection::Down, Some(json!(value))).new_path
    })
}

proptest! {
    #[test]
    fn test_drill_up_undoes_down(
        values in prop::collection::vec("[A-Za-z' ]{0,12}", 0..3),
        clicked in "[A-Za-z' ]{0,12}",
    ) {
        let service = DrillService::default();
        let start = path_through(&service, &values);

        let down = drill(&service, start.clone(), DrillDirection::Down, Some(json!(clicked)));
        prop_assert!(down.success);
        prop_assert_eq!(down.new_path.current_level, start.current_level + 1);

        let up = drill(&service, down.new_path, DrillDirection::Up, None);
        prop_assert!(up.success);
        prop_assert_eq!(up.new_path, start);
    }

    #[test]
    fn test_drill_level_stays_in_bounds(
        moves in prop::collection::vec(any::<bool>(), 0..20),
    ) {
        let service = DrillService::default();
        let max = hierarchy().max_level();
        let mut path = service.initial_path(&hierarchy());

        for down in moves {
            let before = path.current_level;
            let response = if down {
                drill(&service, path, DrillDirection::Down, Some(json!("x")))
            } else {
                drill(&service, path, DrillDirection::Up, None)
            };

            let at_edge = (down && before == max) || (!down && before == 0);
            prop_assert_eq!(response.success, !at_edge);
            prop_assert!(response.new_path.current_level <= max);
            prop_assert_eq!(response.new_path.breadcrumbs.len(), response.new_path.current_level);
            prop_assert_eq!(response.can_drill_up, response.new_path.current_level > 0);
            path = response.new_path;
        }
    }

    #[test]
    fn test_string_values_cannot_break_out(text in ".{0,40}") {
        let service = FilterService::new(SqlDialect::Postgres);
        let condition = FilterCondition::new("name", FilterOperator::Equals, json!(text.clone()));
        let sql = service.build_condition(&condition).unwrap();

        let literal = sql.strip_prefix("\"name\" = '").and_then(|s| s.strip_suffix('\''));
        prop_assert!(literal.is_some());
        let literal = literal.unwrap();
        // Every quote inside the literal is part of a doubled pair
        prop_assert!(!literal.replace("''", "").contains('\''));
        prop_assert_eq!(literal.replace("''", "'"), text);
    }

    #[test]
    fn test_in_lists(values in prop::collection::vec(0i64..1000, 0..6)) {
        let service = FilterService::new(SqlDialect::Postgres);
        let list = Value::Array(values.iter().map(|v| json!(v)).collect());

        let included = service
            .build_condition(&FilterCondition::new("id", FilterOperator::In, list.clone()))
            .unwrap();
        let excluded = service
            .build_condition(&FilterCondition::new("id", FilterOperator::NotIn, list))
            .unwrap();

        if values.is_empty() {
            prop_assert_eq!(included, "1=0");
            prop_assert_eq!(excluded, "1=1");
        } else {
            let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            prop_assert_eq!(included, format!("\"id\" IN ({})", items.join(", ")));
            prop_assert_eq!(excluded, format!("\"id\" NOT IN ({})", items.join(", ")));
        }
    }

    #[test]
    fn test_like_pattern_matches_literal_text(
        prefix in "[a-z.()+*?]{0,8}",
        middle in "[a-z.()+*?]{0,8}",
        suffix in "[a-z.()+*?]{0,8}",
    ) {
        // Metacharacters in the text must match themselves
        let exact = Regex::new(&like_to_regex(&format!("{prefix}{middle}{suffix}"))).unwrap();
        let exact_text = format!("{prefix}{middle}{suffix}");
        prop_assert!(exact.is_match(&exact_text));

        let contains = Regex::new(&like_to_regex(&format!("%{middle}%"))).unwrap();
        let haystack = format!("{prefix}{middle}{suffix}");
        prop_assert!(contains.is_match(&haystack));

        let anchored = Regex::new(&like_to_regex(&format!("{middle}_"))).unwrap();
        let one_extra = format!("{middle}z");
        let two_extra = format!("{middle}zz");
        prop_assert!(anchored.is_match(&one_extra));
        prop_assert!(!anchored.is_match(&two_extra));
    }
}
