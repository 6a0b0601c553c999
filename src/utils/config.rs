//! Configuration parameters struct parsing helper.

use crate::utils::BiphaseError;

/// Trait for configuration structs whose fields carry constraints beyond
/// what parsing can express, e.g. a deadline that must fit within a period.
/// `parsed_config!` runs the check on every composed config, including an
/// all-defaults one.
pub trait ValidatedConfig {
    /// Checks the cross-field constraints of a composed configuration.
    fn validate(&self) -> Result<(), BiphaseError>;
}

/// Composes a configuration struct from its default values, overwrites
/// given fields by parsing from given TOML string if it's not `None`, then
/// validates the result. Returns an `Ok(config)` on success, and
/// `Err(BiphaseError)` on parser failure, unexpected field names, or a
/// failed validation.
///
/// Example:
/// ```no_run
/// let config = parsed_config!(config_str => MyConfig; batch_size, period_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, BiphaseError> {
            let mut config: $config_type = Default::default();

            if let Some(config_str) = config_str {
                let mut table = config_str.parse::<toml::Table>()?;

                // traverse through all given field names
                $({
                    // if field name found in table (and removed)
                    if let Some(v) = table.remove(stringify!($field)) {
                        config.$field = v.try_into()?;
                    }
                })+

                // if table is not empty at this time, some parsed keys are
                // not expected hence invalid
                if !table.is_empty() {
                    return Err(BiphaseError(format!(
                        "invalid field name '{}' in config",
                        table.keys().next().unwrap(),
                    )));
                }
            }

            $crate::utils::ValidatedConfig::validate(&config)?;
            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::{BiphaseError, ValidatedConfig};

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        abc: u16,
        hij: String,
        lmn: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                abc: 7,
                hij: "Jose".into(),
                lmn: 6.18,
            }
        }
    }

    impl ValidatedConfig for TestConfig {
        fn validate(&self) -> Result<(), BiphaseError> {
            if self.lmn < 0.0 {
                Err(BiphaseError(format!("negative lmn {}", self.lmn)))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), BiphaseError> {
        let config = parsed_config!(None => TestConfig; abc, hij, lmn)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), BiphaseError> {
        let config_str = Some("hij = 'Nice'");
        let config = parsed_config!(config_str => TestConfig; hij, lmn)?;
        let ref_config = TestConfig {
            abc: 7,
            hij: "Nice".into(),
            lmn: 6.18,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; abc).is_err());
    }

    #[test]
    fn parse_failed_validation() {
        let config_str = Some("lmn = -1.0");
        assert!(parsed_config!(config_str => TestConfig; lmn).is_err());
    }
}
