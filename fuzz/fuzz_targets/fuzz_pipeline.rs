#![no_main]
use helios::pipeline::{Pipeline, PipelineConfig};
use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;

static PIPELINES: Lazy<Vec<Pipeline>> = Lazy::new(|| {
    let configs = [
        PipelineConfig {
            jq: Some(".data[0].value".to_string()),
            ..Default::default()
        },
        PipelineConfig {
            regex: Some(r"power=(\d+)".to_string()),
            default: Some("0".to_string()),
            ..Default::default()
        },
        PipelineConfig {
            unpack: Some("hex".to_string()),
            decode: Some("float32".to_string()),
            ..Default::default()
        },
    ];
    configs.iter().filter_map(|c| Pipeline::new(c).ok()).collect()
});

fuzz_target!(|data: &[u8]| {
    for pipeline in PIPELINES.iter() {
        let _ = pipeline.process(data);
    }
});
