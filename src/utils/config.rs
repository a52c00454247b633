//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(EpoxideError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; timeout, seed)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::EpoxideError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err($crate::EpoxideError(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::EpoxideError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Eq, Deserialize)]
    struct TestConfig {
        timeout: u64,
        name: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                timeout: 2,
                name: "default".into(),
            }
        }
    }

    #[test]
    fn parse_default() -> Result<(), EpoxideError> {
        let config = parsed_config!(None => TestConfig; timeout, name)?;
        assert_eq!(config, TestConfig::default());
        Ok(())
    }

    #[test]
    fn parse_overwrite() -> Result<(), EpoxideError> {
        let config =
            parsed_config!(Some("timeout = 7") => TestConfig; timeout, name)?;
        assert_eq!(config.timeout, 7);
        assert_eq!(config.name, "default".to_string());
        Ok(())
    }

    #[test]
    fn parse_invalid() {
        let config = parsed_config!(Some("tims = 7") => TestConfig; timeout);
        assert!(config.is_err());
        let config =
            parsed_config!(Some("timeout = \"x\"") => TestConfig; timeout);
        assert!(config.is_err());
    }
}
