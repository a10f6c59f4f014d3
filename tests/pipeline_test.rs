use helios::pipeline::{Pipeline, PipelineConfig};

fn pipeline(yaml: &str) -> Pipeline {
    let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
    Pipeline::new(&config).unwrap()
}

#[test]
fn regex_capture_feeds_query() {
    let p = pipeline("regex: 'data=(\\{.*\\})'\njq: .sensors[1].value\n");
    let payload = br#"status=ok data={"sensors":[{"value":1},{"value":22.5}]}"#;
    assert_eq!(p.process(payload).unwrap(), "22.5");
}

#[test]
fn regex_default_replaces_missing_match() {
    let p = pipeline("regex: 'power: (\\d+)'\ndefault: '0'\n");
    assert_eq!(p.process(b"power: 1500").unwrap(), "1500");
    assert_eq!(p.process(b"offline").unwrap(), "0");
}

#[test]
fn query_renders_strings_without_quotes() {
    let p = pipeline("jq: .state\n");
    assert_eq!(p.process(br#"{"state":"charging"}"#).unwrap(), "charging");
}

#[test]
fn stage_errors_name_the_stage() {
    let p = pipeline("unpack: hex\ndecode: int32\n");
    assert_eq!(p.process(b"FFFFFFFE").unwrap(), "-2");
    let err = p.process(b"FFFF").unwrap_err().to_string();
    assert!(err.contains("decode"));
}
