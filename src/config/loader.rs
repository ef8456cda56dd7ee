use super::schema::{Config, InputConfig, OutputConfig};
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::net::SocketAddr;
use std::path::Path;

const ENV_PREFIX: &str = "HTTP_MIRROR_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("http-mirror.toml"))
        .merge(Json::file("http-mirror.json"))
        .merge(Yaml::file("http-mirror.yaml"))
        .merge(Yaml::file("http-mirror.yml"))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.inputs.is_empty() || config.outputs.is_empty() {
        return Err(ConfigError::Validation(
            "Required at least 1 input and 1 output".into(),
        )
        .into());
    }

    for (index, input) in config.inputs.iter().enumerate() {
        match input {
            InputConfig::Capture {
                listen,
                upstream,
                queue_size,
                ..
            } => {
                parse_socket_addr(listen, &format!("inputs[{index}].listen"))?;
                parse_http_url(upstream, &format!("inputs[{index}].upstream"))?;
                if *queue_size == 0 {
                    return Err(ConfigError::Validation(format!(
                        "inputs[{index}].queueSize must be greater than 0"
                    ))
                    .into());
                }
            }
            InputConfig::File { speed, .. } => {
                if !speed.is_finite() || *speed < 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "inputs[{index}].speed must be a non-negative number"
                    ))
                    .into());
                }
            }
            InputConfig::Tcp { address } => {
                parse_socket_addr(address, &format!("inputs[{index}].address"))?;
            }
            InputConfig::Stdin => {}
        }
    }

    for (index, output) in config.outputs.iter().enumerate() {
        match output {
            OutputConfig::Http(http) => {
                parse_http_url(&http.url, &format!("outputs[{index}].url"))?;
                if http.workers == 0 {
                    return Err(ConfigError::Validation(format!(
                        "outputs[{index}].workers must be greater than 0"
                    ))
                    .into());
                }
                if http.retry_budget == 0 {
                    return Err(ConfigError::Validation(format!(
                        "outputs[{index}].retryBudget must be at least 1"
                    ))
                    .into());
                }
                if http.rate_limit == Some(0) {
                    return Err(ConfigError::Validation(format!(
                        "outputs[{index}].rateLimit must be greater than 0"
                    ))
                    .into());
                }
            }
            OutputConfig::Tcp {
                address,
                retry_budget,
                timeout_ms,
            } => {
                if address.is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "outputs[{index}].address"
                    ))
                    .into());
                }
                if *retry_budget == 0 {
                    return Err(ConfigError::Validation(format!(
                        "outputs[{index}].retryBudget must be at least 1"
                    ))
                    .into());
                }
                if *timeout_ms == 0 {
                    return Err(ConfigError::Validation(format!(
                        "outputs[{index}].timeoutMs must be greater than 0"
                    ))
                    .into());
                }
            }
            OutputConfig::File { .. } | OutputConfig::Discard => {}
        }
    }

    if let Some(middleware) = &config.middleware {
        if middleware.command.is_empty() {
            return Err(ConfigError::Validation("Middleware has empty command".into()).into());
        }
        if middleware.queue_size == 0 {
            return Err(ConfigError::Validation(
                "Middleware queueSize must be greater than 0".into(),
            )
            .into());
        }
    }

    if config.emitter.lane_capacity == 0 {
        return Err(ConfigError::Validation("Lane capacity must be greater than 0".into()).into());
    }

    if let Some(address) = &config.diagnostics.address {
        parse_socket_addr(address, "diagnostics.address")?;
    }

    Ok(())
}

fn parse_socket_addr(value: &str, field: &str) -> Result<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::Validation(format!("{field}: invalid address {value:?}: {e}")).into())
}

fn parse_http_url(value: &str, field: &str) -> Result<url::Url> {
    let url = url::Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{field}: invalid URL {value:?}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::Validation(format!("{field}: {value:?} is not an HTTP URL")).into());
    }
    Ok(url)
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for output in &mut config.outputs {
        if let OutputConfig::Http(http) = output {
            http.url = substitute_env_vars(&http.url)?;
            for value in http.headers.values_mut() {
                *value = substitute_env_vars(value)?;
            }
        }
    }

    for input in &mut config.inputs {
        if let InputConfig::Capture { upstream, .. } = input {
            *upstream = substitute_env_vars(upstream)?;
        }
    }

    if let Some(middleware) = &mut config.middleware {
        for arg in &mut middleware.args {
            *arg = substitute_env_vars(arg)?;
        }
        for value in middleware.env.values_mut() {
            *value = substitute_env_vars(value)?;
        }
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{FailurePolicy, HttpOutputConfig};
    use std::io::Write;

    fn minimal() -> Config {
        Config {
            inputs: vec![InputConfig::Stdin],
            outputs: vec![OutputConfig::Discard],
            middleware: None,
            emitter: Default::default(),
            diagnostics: Default::default(),
            logging: Default::default(),
        }
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("HTTP_MIRROR_TEST_VAR", "staging.internal");

        let result = substitute_env_vars("http://${HTTP_MIRROR_TEST_VAR}:8080").unwrap();
        assert_eq!(result, "http://staging.internal:8080");

        let result = substitute_env_vars("${HTTP_MIRROR_MISSING:-fallback}").unwrap();
        assert_eq!(result, "fallback");

        assert!(substitute_env_vars("${HTTP_MIRROR_DEFINITELY_MISSING}").is_err());

        std::env::remove_var("HTTP_MIRROR_TEST_VAR");
    }

    #[test]
    fn test_validate_requires_inputs_and_outputs() {
        let mut config = minimal();
        assert!(validate(&config).is_ok());

        config.outputs.clear();
        assert!(validate(&config).is_err());

        let mut config = minimal();
        config.inputs.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_http_output() {
        let mut config = minimal();
        config.outputs = vec![OutputConfig::Http(HttpOutputConfig::new("ftp://staging"))];
        assert!(validate(&config).is_err());

        let mut http = HttpOutputConfig::new("http://staging:8080");
        http.retry_budget = 0;
        config.outputs = vec![OutputConfig::Http(http)];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_capture_address() {
        let mut config = minimal();
        config.inputs = vec![InputConfig::Capture {
            listen: "not an address".into(),
            upstream: "http://127.0.0.1:80".into(),
            queue_size: 10,
            max_body_bytes: 1024,
        }];
        assert!(validate(&config).is_err());
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
inputs:
  - type: file
    path: /tmp/requests.gor
    loop: true
    speed: 2.0
  - type: tcp
    address: 127.0.0.1:28020
outputs:
  - type: http
    url: http://staging:8080
    workers: 4
    timeoutMs: 250
    rateLimit: 100
    headers:
      X-Mirrored: "true"
  - type: file
    path: /tmp/out.gor
  - type: discard
middleware:
  command: ./filter.sh
  onFailure: failOpen
emitter:
  shutdownGraceMs: 1000
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.inputs.len(), 2);
        assert!(matches!(
            &config.inputs[0],
            InputConfig::File { r#loop: true, speed, .. } if *speed == 2.0
        ));
        match &config.outputs[0] {
            OutputConfig::Http(http) => {
                assert_eq!(http.workers, 4);
                assert_eq!(http.timeout_ms, 250);
                assert_eq!(http.rate_limit, Some(100));
                assert_eq!(http.headers.get("X-Mirrored").map(String::as_str), Some("true"));
            }
            other => panic!("unexpected output {other:?}"),
        }
        assert!(matches!(config.outputs[2], OutputConfig::Discard));
        let middleware = config.middleware.unwrap();
        assert_eq!(middleware.on_failure, FailurePolicy::FailOpen);
        assert_eq!(config.emitter.shutdown_grace_ms, 1000);
        assert_eq!(config.emitter.lane_capacity, 1000);
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_from_path(file.path()).await.is_err());
    }
}
