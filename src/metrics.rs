use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::models::Usage;

#[derive(Clone)]
pub struct BackendMetrics {
    registry: Registry,
    generations_total: IntCounterVec,
    generation_duration_seconds: HistogramVec,
    open_streams: IntGauge,
    tokens_total: IntCounterVec,
    probes_total: IntCounterVec,
    switches_total: IntCounterVec,
    model_loads_total: IntCounterVec,
}

/// Keeps `backend_open_streams` raised while a stream is alive; dropping the
/// stream early lowers it again.
pub struct OpenStreamGuard {
    gauge: IntGauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Sync,
    Stream,
}

impl GenerationMode {
    fn label(self) -> &'static str {
        match self {
            GenerationMode::Sync => "sync",
            GenerationMode::Stream => "stream",
        }
    }
}

fn outcome_label(success: bool) -> &'static str {
    if success {
        "ok"
    } else {
        "error"
    }
}

impl BackendMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let generations_total = IntCounterVec::new(
            opts!(
                "backend_generations_total",
                "Generation calls by backend, mode and outcome"
            ),
            &["backend", "mode", "outcome"],
        )
        .expect("valid generations_total metric");

        let generation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "backend_generation_duration_seconds",
                "Generation latency in seconds (time to first byte for streams)",
            ),
            &["backend", "mode"],
        )
        .expect("valid generation_duration_seconds metric");

        let open_streams = IntGauge::new(
            "backend_open_streams",
            "Response streams currently held by consumers",
        )
        .expect("valid open_streams metric");

        let tokens_total = IntCounterVec::new(
            opts!("backend_tokens_total", "Token accounting by backend and type"),
            &["backend", "kind"],
        )
        .expect("valid tokens_total metric");

        let probes_total = IntCounterVec::new(
            opts!("backend_probes_total", "Liveness probes by backend and outcome"),
            &["backend", "outcome"],
        )
        .expect("valid probes_total metric");

        let switches_total = IntCounterVec::new(
            opts!("backend_switches_total", "Active backend switch attempts"),
            &["outcome"],
        )
        .expect("valid switches_total metric");

        let model_loads_total = IntCounterVec::new(
            opts!("backend_model_loads_total", "Model provisioning attempts"),
            &["backend", "outcome"],
        )
        .expect("valid model_loads_total metric");

        registry
            .register(Box::new(generations_total.clone()))
            .expect("register generations_total");
        registry
            .register(Box::new(generation_duration_seconds.clone()))
            .expect("register generation_duration_seconds");
        registry
            .register(Box::new(open_streams.clone()))
            .expect("register open_streams");
        registry
            .register(Box::new(tokens_total.clone()))
            .expect("register tokens_total");
        registry
            .register(Box::new(probes_total.clone()))
            .expect("register probes_total");
        registry
            .register(Box::new(switches_total.clone()))
            .expect("register switches_total");
        registry
            .register(Box::new(model_loads_total.clone()))
            .expect("register model_loads_total");

        Self {
            registry,
            generations_total,
            generation_duration_seconds,
            open_streams,
            tokens_total,
            probes_total,
            switches_total,
            model_loads_total,
        }
    }

    pub fn observe_generation(
        &self,
        backend: &str,
        mode: GenerationMode,
        success: bool,
        duration: Duration,
    ) {
        self.generations_total
            .with_label_values(&[backend, mode.label(), outcome_label(success)])
            .inc();
        if success {
            self.generation_duration_seconds
                .with_label_values(&[backend, mode.label()])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn observe_usage(&self, backend: &str, usage: &Usage) {
        for (kind, count) in usage {
            self.tokens_total
                .with_label_values(&[backend, kind.as_str()])
                .inc_by(*count);
        }
    }

    pub fn observe_probe(&self, backend: &str, available: bool) {
        let outcome = if available { "up" } else { "down" };
        self.probes_total.with_label_values(&[backend, outcome]).inc();
    }

    pub fn observe_switch(&self, success: bool) {
        self.switches_total
            .with_label_values(&[outcome_label(success)])
            .inc();
    }

    pub fn observe_model_load(&self, backend: &str, success: bool) {
        self.model_loads_total
            .with_label_values(&[backend, outcome_label(success)])
            .inc();
    }

    pub fn open_stream_guard(&self) -> OpenStreamGuard {
        self.open_streams.inc();
        OpenStreamGuard {
            gauge: self.open_streams.clone(),
        }
    }

    pub fn open_streams(&self) -> i64 {
        self.open_streams.get()
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for BackendMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
