//! The `PAUSE_LAYER` debugging hook: blocks on a stdin line
//! before processing at a named layer, so a developer stepping through a
//! capture can single-step the pipeline. Re-architected from scattered
//! `env::var` checks into a trait so call sites don't know the mechanism.

use std::io::{self, BufRead};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Ip,
    Tcp,
    Tls,
    Http,
}

impl Layer {
    fn env_name(self) -> &'static str {
        match self {
            Layer::Ip => "ip",
            Layer::Tcp => "tcp",
            Layer::Tls => "tls",
            Layer::Http => "http",
        }
    }
}

pub trait LayerPause: Send + Sync {
    fn maybe_pause(&self, layer: Layer);
}

/// Blocks on a stdin newline before returning, for every layer named in
/// `PAUSE_LAYER`.
pub struct StdinPause {
    layers: Vec<Layer>,
}

impl StdinPause {
    pub fn from_env_value(value: &str) -> Self {
        let layers = value
            .split(',')
            .filter_map(|name| match name.trim() {
                "ip" => Some(Layer::Ip),
                "tcp" => Some(Layer::Tcp),
                "tls" => Some(Layer::Tls),
                "http" => Some(Layer::Http),
                _ => None,
            })
            .collect();
        StdinPause { layers }
    }
}

impl LayerPause for StdinPause {
    fn maybe_pause(&self, layer: Layer) {
        if !self.layers.contains(&layer) {
            return;
        }
        tracing::info!(layer = layer.env_name(), "PAUSE_LAYER: waiting for stdin newline");
        let mut discard = String::new();
        let _ = io::stdin().lock().read_line(&mut discard);
    }
}

pub struct NoPause;

impl LayerPause for NoPause {
    fn maybe_pause(&self, _layer: Layer) {}
}

/// Selects the pause behavior once at startup from the `PAUSE_LAYER`
/// environment variable.
pub fn from_env() -> Box<dyn LayerPause> {
    match std::env::var("PAUSE_LAYER") {
        Ok(value) if !value.trim().is_empty() => Box::new(StdinPause::from_env_value(&value)),
        _ => Box::new(NoPause),
    }
}
