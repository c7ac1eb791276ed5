use orc_engine::types::{
    parse_dimension_level, parse_size_level, DimensionLevel, SizeLevel,
};

#[test]
fn size_level_round_trips_through_yaml() {
    for level in [SizeLevel::Small, SizeLevel::Medium, SizeLevel::Large] {
        let yaml = serde_yaml_ng::to_string(&level).unwrap();
        let back: SizeLevel = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(level, back);
    }
}

#[test]
fn dimension_level_round_trips_through_yaml() {
    for level in [DimensionLevel::Low, DimensionLevel::Medium, DimensionLevel::High] {
        let yaml = serde_yaml_ng::to_string(&level).unwrap();
        let back: DimensionLevel = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(level, back);
    }
}

#[test]
fn size_level_display_is_lowercase() {
    assert_eq!(SizeLevel::Small.to_string(), "small");
    assert_eq!(SizeLevel::Medium.to_string(), "medium");
    assert_eq!(SizeLevel::Large.to_string(), "large");
}

#[test]
fn dimension_level_display_is_lowercase() {
    assert_eq!(DimensionLevel::Low.to_string(), "low");
    assert_eq!(DimensionLevel::Medium.to_string(), "medium");
    assert_eq!(DimensionLevel::High.to_string(), "high");
}

#[test]
fn parse_size_level_accepts_full_names_and_shorthand() {
    assert_eq!(parse_size_level("small").unwrap(), SizeLevel::Small);
    assert_eq!(parse_size_level("M").unwrap(), SizeLevel::Medium);
    assert_eq!(parse_size_level("large").unwrap(), SizeLevel::Large);
}

#[test]
fn parse_size_level_rejects_unknown_value() {
    assert!(parse_size_level("huge").is_err());
}

#[test]
fn parse_dimension_level_accepts_full_names_and_shorthand() {
    assert_eq!(parse_dimension_level("low").unwrap(), DimensionLevel::Low);
    assert_eq!(parse_dimension_level("m").unwrap(), DimensionLevel::Medium);
    assert_eq!(parse_dimension_level("HIGH").unwrap(), DimensionLevel::High);
}

#[test]
fn parse_dimension_level_rejects_unknown_value() {
    assert!(parse_dimension_level("extreme").is_err());
}
