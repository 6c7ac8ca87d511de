use lmrelay_common::{FileConfig, GlobalConfigPatch, ModelListSource, ConfigError};
use lmrelay_protocol::{ModelFamily, Service};

const SAMPLE: &str = r#"
port = 9000
queue_timeout_secs = 30
allowed_model_families = ["gpt4o", "claude-sonnet"]

[services.openai]
keys = ["sk-one", "sk-two"]
max_concurrency = 2
model_list = "upstream"

[services.anthropic]
base_url = "https://anthropic.internal/"
flagship_model = ""

[[services.anthropic.credentials]]
secret = "ant-key"
families = ["claude-sonnet"]
models = ["claude-3-5-sonnet-latest"]
"#;

#[test]
fn parses_services_and_credentials() {
    let patch = FileConfig::parse(SAMPLE, "sample.toml")
        .and_then(FileConfig::into_patch)
        .unwrap();
    let config = patch.into_config().unwrap();

    assert_eq!(config.port, 9000);
    assert_eq!(config.queue_timeout_secs, 30);
    assert!(config.family_allowed(ModelFamily::Gpt4o));
    assert!(!config.family_allowed(ModelFamily::Turbo));

    let openai = config.service(Service::OpenAI).unwrap();
    assert_eq!(openai.credentials.len(), 2);
    assert_eq!(openai.max_concurrency, 2);
    assert_eq!(openai.model_list, ModelListSource::Upstream);

    let anthropic = config.service(Service::Anthropic).unwrap();
    assert_eq!(anthropic.base_url, "https://anthropic.internal");
    assert_eq!(anthropic.flagship_model, None);
    assert_eq!(
        anthropic.credentials[0].families,
        Some(vec![ModelFamily::ClaudeSonnet])
    );
    assert!(config.service(Service::GoogleAI).is_none());
}

#[test]
fn env_keys_override_file_credentials() {
    let mut patch = FileConfig::parse(SAMPLE, "sample.toml")
        .and_then(FileConfig::into_patch)
        .unwrap();
    let mut env = GlobalConfigPatch::default();
    env.keys.insert(Service::OpenAI, vec!["sk-env".to_string()]);
    patch.overlay(env);
    let config = patch.into_config().unwrap();
    let openai = config.service(Service::OpenAI).unwrap();
    assert_eq!(openai.credentials.len(), 1);
    assert_eq!(openai.credentials[0].secret, "sk-env");
    assert_eq!(openai.max_concurrency, 2);
}

#[test]
fn unknown_service_is_rejected() {
    let err = FileConfig::parse("[services.mistral]\nkeys = [\"x\"]\n", "bad.toml")
        .and_then(FileConfig::into_patch)
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownService(name) if name == "mistral"));
}
