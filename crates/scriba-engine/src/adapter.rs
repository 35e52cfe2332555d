// SPDX-License-Identifier: MIT OR Apache-2.0
//! The engine adapter and the process-wide adapter cache.
//!
//! All entry points on one adapter serialize through its mutex; the decode
//! itself is blocking and is expected to run on a blocking thread. The cache
//! is process-local and never shared across worker processes.

use crate::{
    DecodeError, DecodeOptions, DecodeRequest, Decoder, DecoderFactory, Device, EngineError,
    EngineResult, EngineVariant, NullSink, TokenSink, is_accelerator_dependency_error,
    is_vad_rejection, silence_ratio, summarize_accelerator_error, unexpected_keyword,
};
use scriba_config::{DevicePreference, VadMode};
use scriba_core::Precision;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Silence share above which `VadMode::Auto` turns the filter on.
const SILENCE_RATIO_THRESHOLD: f64 = 0.30;

/// Knobs fixed at adapter construction time.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Which engine implementation to front.
    pub variant: EngineVariant,
    /// Model identifier.
    pub model_size: String,
    /// Declared device preference.
    pub device: DevicePreference,
    /// Treat the accelerator as present even when the probe disagrees.
    pub force_accelerator: bool,
    /// Voice-activity-filter mode.
    pub vad: VadMode,
}

struct AdapterState {
    decoder: Option<Box<dyn Decoder>>,
    device: Device,
    warmed_up: bool,
    /// Keys rejected by the engine at runtime; never offered again.
    retired_keys: BTreeSet<String>,
}

/// Uniform facade over one engine instance. Shared and internally
/// serialized; clone the [`Arc`] handed out by [`EngineCache`].
pub struct EngineAdapter {
    settings: AdapterSettings,
    factory: Arc<dyn DecoderFactory>,
    state: Mutex<AdapterState>,
}

impl EngineAdapter {
    /// Create an adapter; the decoder is instantiated lazily on first use.
    pub fn new(settings: AdapterSettings, factory: Arc<dyn DecoderFactory>) -> Self {
        let device = resolve_device(
            settings.device,
            settings.force_accelerator,
            factory.accelerator_available(),
        );
        Self {
            settings,
            factory,
            state: Mutex::new(AdapterState {
                decoder: None,
                device,
                warmed_up: false,
                retired_keys: BTreeSet::new(),
            }),
        }
    }

    /// The device decodes currently run on.
    #[must_use]
    pub fn effective_device(&self) -> Device {
        self.state.lock().expect("adapter mutex poisoned").device
    }

    /// Decode `audio_path` with the variant's capability filter, device
    /// policy, and one-shot recovery ladders applied.
    pub fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        beam_size: Option<u32>,
        options: DecodeOptions,
        precision: Precision,
        sink: &mut dyn TokenSink,
    ) -> Result<EngineResult, EngineError> {
        let mut state = self.state.lock().expect("adapter mutex poisoned");

        self.ensure_decoder(&mut state)?;
        self.warmup_if_needed(&mut state);

        let mut filtered = self.filter_options(&state, options, sink);
        let vad_enabled = self.resolve_vad(audio_path);
        if self
            .settings
            .variant
            .accepted_options()
            .contains(&"vad_filter")
        {
            filtered.insert("vad_filter".into(), vad_enabled.into());
        }

        let started = Instant::now();
        let mut retried_keyword = false;
        let mut retried_device = false;
        let mut retried_vad = false;

        let output = loop {
            let request = DecodeRequest {
                audio_path,
                language,
                beam_size,
                options: filtered.clone(),
                precision,
                model_size: &self.settings.model_size,
            };
            let decoder = state.decoder.as_ref().expect("decoder present after ensure");
            match decoder.decode(&request, sink) {
                Ok(output) => break output,
                Err(err) => {
                    if !retried_keyword {
                        if let Some(key) = unexpected_keyword(&err.message) {
                            if filtered.remove(&key).is_some() {
                                retried_keyword = true;
                                state.retired_keys.insert(key.clone());
                                sink.on_debug(
                                    "transcribe.option",
                                    &format!("engine rejected option {key}, retrying without it"),
                                );
                                debug!(option = %key, "retired decode option after runtime rejection");
                                continue;
                            }
                        }
                    }

                    if !retried_device
                        && state.device == Device::Accelerator
                        && is_accelerator_dependency_error(&err.message)
                    {
                        retried_device = true;
                        let summary = summarize_accelerator_error(&err.message);
                        warn!(reason = %summary, "accelerator dependencies missing, retrying on cpu");
                        sink.on_debug("transcribe.device", &summary);
                        state.device = Device::Cpu;
                        state.decoder = None;
                        self.ensure_decoder(&mut state)?;
                        continue;
                    }

                    if !retried_vad
                        && filtered.get("vad_filter").and_then(|v| v.as_bool()) == Some(true)
                        && is_vad_rejection(&err.message)
                    {
                        retried_vad = true;
                        filtered.insert("vad_filter".into(), false.into());
                        sink.on_debug(
                            "transcribe.vad",
                            "engine rejected the voice-activity filter, retrying without it",
                        );
                        continue;
                    }

                    return Err(EngineError::Decode(err.message));
                }
            }
        };

        Ok(EngineResult {
            text: output.text,
            language: output
                .language
                .or_else(|| language.map(str::to_string)),
            duration: output.duration,
            segments: output.segments,
            runtime_seconds: started.elapsed().as_secs_f64(),
            device: state.device,
        })
    }

    fn ensure_decoder(&self, state: &mut AdapterState) -> Result<(), EngineError> {
        if state.decoder.is_some() {
            return Ok(());
        }
        let decoder = self
            .factory
            .create(self.settings.variant, &self.settings.model_size, state.device)
            .map_err(|e| EngineError::Init(e.message))?;
        state.decoder = Some(decoder);
        Ok(())
    }

    /// The fallback variant decodes ~0.5 s of silence on first load to
    /// amortize model initialization. Best-effort.
    fn warmup_if_needed(&self, state: &mut AdapterState) {
        if state.warmed_up || self.settings.variant != EngineVariant::Fallback {
            state.warmed_up = true;
            return;
        }
        state.warmed_up = true;
        let Ok(warmup) = crate::stub::write_silence_wav(0.5) else {
            return;
        };
        let request = DecodeRequest {
            audio_path: warmup.path(),
            language: None,
            beam_size: None,
            options: DecodeOptions::new(),
            precision: Precision::Float16,
            model_size: &self.settings.model_size,
        };
        let decoder = state.decoder.as_ref().expect("decoder present for warmup");
        if let Err(err) = decoder.decode(&request, &mut NullSink) {
            debug!(error = %err, "warmup decode failed");
        }
    }

    fn filter_options(
        &self,
        state: &AdapterState,
        options: DecodeOptions,
        sink: &mut dyn TokenSink,
    ) -> DecodeOptions {
        let accepted = self.settings.variant.accepted_options();
        let mut filtered = DecodeOptions::new();
        for (key, value) in options {
            if state.retired_keys.contains(&key) {
                sink.on_debug(
                    "transcribe.option",
                    &format!("dropping previously retired option {key}"),
                );
                continue;
            }
            if !accepted.contains(&key.as_str()) {
                sink.on_debug(
                    "transcribe.option",
                    &format!("dropping unsupported option {key}"),
                );
                continue;
            }
            filtered.insert(key, value);
        }
        filtered
    }

    fn resolve_vad(&self, audio_path: &Path) -> bool {
        match self.settings.vad {
            VadMode::On => true,
            VadMode::Off => false,
            VadMode::Auto => silence_ratio(audio_path) > SILENCE_RATIO_THRESHOLD,
        }
    }
}

/// Device policy:
///
/// * `Auto`: accelerator iff the runtime reports one.
/// * `Accelerator`: accelerator if available or forced, otherwise CPU with
///   a warning.
/// * `Cpu`: CPU always.
#[must_use]
pub fn resolve_device(preference: DevicePreference, force: bool, available: bool) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Auto => {
            if available {
                Device::Accelerator
            } else {
                Device::Cpu
            }
        }
        DevicePreference::Accelerator => {
            if available || force {
                Device::Accelerator
            } else {
                warn!("accelerator requested but unavailable, using cpu");
                Device::Cpu
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter cache
// ---------------------------------------------------------------------------

/// Process-wide adapter cache keyed by (variant, model size, device
/// preference). Owned by the composition root; never shared across worker
/// processes.
pub struct EngineCache {
    factory: Arc<dyn DecoderFactory>,
    adapters: Mutex<HashMap<(EngineVariant, String, DevicePreference), Arc<EngineAdapter>>>,
}

impl EngineCache {
    /// Create an empty cache dispatching to `factory`.
    pub fn new(factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            factory,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached adapter for these parameters, creating it on first
    /// request.
    pub fn get_or_create(&self, settings: AdapterSettings) -> Arc<EngineAdapter> {
        let key = (
            settings.variant,
            settings.model_size.clone(),
            settings.device,
        );
        let mut adapters = self.adapters.lock().expect("cache mutex poisoned");
        adapters
            .entry(key)
            .or_insert_with(|| Arc::new(EngineAdapter::new(settings, self.factory.clone())))
            .clone()
    }

    /// Number of distinct adapters currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.lock().expect("cache mutex poisoned").len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
