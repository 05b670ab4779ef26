//! Property-based tests for model types.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    /// Strategy to generate valid permission codes in resource:operation format
    fn valid_code_strategy() -> impl Strategy<Value = String> {
        ("[a-z_]{1,12}", "[a-z_]{1,12}").prop_map(|(r, o)| format!("{r}:{o}"))
    }

    fn level_strategy() -> impl Strategy<Value = crate::model::PermissionLevel> {
        use crate::model::PermissionLevel;
        prop_oneof![
            Just(PermissionLevel::Read),
            Just(PermissionLevel::Write),
            Just(PermissionLevel::Admin),
            Just(PermissionLevel::Owner),
        ]
    }

    fn operation_strategy() -> impl Strategy<Value = crate::model::Operation> {
        use crate::model::Operation;
        prop_oneof![
            Just(Operation::Create),
            Just(Operation::Read),
            Just(Operation::Update),
            Just(Operation::Delete),
            Just(Operation::Manage),
            "[a-z]{3,10}".prop_map(|s| Operation::parse(&s).unwrap()),
        ]
    }

    proptest! {
        #[test]
        fn test_valid_codes_parse_and_split(code in valid_code_strategy()) {
            use crate::model::PermissionCode;
            let parsed = PermissionCode::parse(code.clone());
            prop_assert!(parsed.is_ok(), "Failed for code: {}", code);
            let parsed = parsed.unwrap();
            prop_assert_eq!(format!("{}:{}", parsed.resource(), parsed.operation()), code);
        }

        #[test]
        fn test_codes_without_colon_are_invalid(s in "[a-z]{1,20}") {
            use crate::model::PermissionCode;
            prop_assert!(PermissionCode::parse(s).is_err());
        }

        #[test]
        fn test_higher_levels_allow_superset(
            low in level_strategy(),
            high in level_strategy(),
            op in operation_strategy()
        ) {
            // Anything a lower level allows, every higher level allows too
            if low <= high && low.allows(&op) {
                prop_assert!(high.allows(&op), "{} allows {} but {} does not", low, op, high);
            }
        }

        #[test]
        fn test_operation_display_parses_back(op in operation_strategy()) {
            use crate::model::Operation;
            let parsed = Operation::parse(&op.to_string()).unwrap();
            prop_assert_eq!(parsed, op);
        }
    }
}
