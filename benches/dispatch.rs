use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use trackpads::{
    CallArgs, EventConfig, InMemoryBackend, LoggerEnv, LoggingFunction, ModuleBlueprint,
    PhaseResult, Tracker, TrackerBuilder, TrackingConfig,
};

struct NoopLogger;

impl LoggingFunction for NoopLogger {
    fn name(&self) -> &str {
        "noop"
    }

    fn pre(&self, _env: &LoggerEnv<'_>) -> PhaseResult {
        PhaseResult::Ok(None)
    }
}

const MAPPING: &str = r#"
[metadata]
library = "lib"
library_version = "1.0"
mapping_version = "1"

[[algorithms]]
name = "add"
[algorithms.implementation]
lib = "lib.mod.f"
[algorithms.hooks]
pads_fit = "always"
"#;

fn tracker_with_hooks(wired: bool) -> Arc<Tracker> {
    let mut config = TrackingConfig::default();
    config.events.clear();
    if wired {
        config
            .events
            .insert("noop".to_string(), EventConfig::on(["pads_fit"]));
    }

    let tracker = TrackerBuilder::new()
        .backend(Arc::new(InMemoryBackend::new()))
        .experiment("bench")
        .without_default_mappings()
        .without_default_loggers()
        .mapping_inline("bench", MAPPING)
        .config(config)
        .build()
        .expect("build tracker");
    tracker.functions().add_function("noop", Arc::new(NoopLogger));

    tracker
        .register_module(ModuleBlueprint::new("lib.mod").function(
            "f",
            Arc::new(|env| {
                let a = env.args.args[0].as_i64().unwrap_or(0);
                let b = env.args.args[1].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            }),
        ))
        .expect("register module");
    tracker
}

fn bench_dispatch(c: &mut Criterion) {
    let args = CallArgs::positional([json!(2), json!(3)]);

    let wrapped = tracker_with_hooks(true);
    c.bench_function("dispatch_with_one_hook", |b| {
        b.iter(|| wrapped.call("lib.mod.f", &args).expect("call"))
    });

    let empty_chain = tracker_with_hooks(false);
    c.bench_function("dispatch_empty_chain", |b| {
        b.iter(|| empty_chain.call("lib.mod.f", &args).expect("call"))
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
