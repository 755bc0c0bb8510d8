//! # Whisper Model Management
//!
//! Loads a Whisper checkpoint with Candle-rs and decodes audio into text.
//!
//! ## Model Loading Process:
//! 1. Resolve `config.json`, `tokenizer.json` and `model.safetensors`, either from a
//!    local directory or from HuggingFace (cached locally after the first download)
//! 2. Load the tokenizer and look up the special tokens the decoder prompt needs
//! 3. Memory-map the weights onto the CPU
//! 4. Build the mel filterbank matching the model's number of mel bins
//!
//! ## Decoding:
//! Audio is converted to a log-mel spectrogram and cut into 30 second windows.
//! Each window is encoded once and decoded greedily; the window texts are joined.

use crate::audio::{mel, SAMPLE_RATE};
use crate::config::EngineConfig;
use anyhow::{anyhow, Context, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Where the three model files live on disk.
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

/// Token ids the decoder prompt is built from.
#[derive(Debug, Clone)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    eot: u32,
    no_timestamps: u32,
    no_speech: Option<u32>,
    language: Option<u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer, language: Option<&str>) -> Result<Self> {
        let token = |name: &str| {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", name))
        };

        let language = match language {
            Some(lang) => Some(
                tokenizer
                    .token_to_id(&format!("<|{}|>", lang))
                    .ok_or_else(|| anyhow!("Language '{}' is not supported by this model", lang))?,
            ),
            None => None,
        };

        Ok(Self {
            sot: token(m::SOT_TOKEN)?,
            transcribe: token(m::TRANSCRIBE_TOKEN)?,
            eot: token(m::EOT_TOKEN)?,
            no_timestamps: token(m::NO_TIMESTAMPS_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|name| tokenizer.token_to_id(name)),
            language,
        })
    }

    fn prompt(&self) -> Vec<u32> {
        let mut prompt = vec![self.sot];
        if let Some(language) = self.language {
            prompt.push(language);
        }
        prompt.push(self.transcribe);
        prompt.push(self.no_timestamps);
        prompt
    }
}

/// Outcome of decoding one 30 second window.
#[derive(Debug)]
struct DecodedWindow {
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
}

impl DecodedWindow {
    /// Confident "no speech" on the first step and low average confidence afterwards.
    fn is_silence(&self) -> bool {
        self.no_speech_prob > m::NO_SPEECH_THRESHOLD && self.avg_logprob < m::LOGPROB_THRESHOLD
    }
}

/// A loaded Whisper model ready for transcription.
///
/// Not thread-safe and not meant to be: the engine gate guarantees one caller at a time.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
    /// Added to the logits at every step; `-inf` on tokens that must never be produced
    suppress_mask: Tensor,
    max_decode_tokens: usize,
}

impl WhisperModel {
    /// Load the model described by the engine configuration onto the CPU.
    pub async fn load(engine: &EngineConfig) -> Result<Self> {
        tracing::info!("Loading Whisper model {}...", engine.model);
        let start_time = std::time::Instant::now();

        let mut files = resolve_files(&engine.model).await?;
        if let Some(tokenizer) = &engine.tokenizer {
            files.tokenizer = PathBuf::from(tokenizer);
        }
        tracing::debug!(?files, "model files resolved");

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("Failed to open {}", files.config.display()))?,
        )?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", files.tokenizer.display(), e))?;
        let tokens = SpecialTokens::resolve(&tokenizer, engine.language.as_deref())?;

        let device = Device::Cpu;
        // SAFETY: the weights file is not modified while the process runs.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let mel_filters = mel::mel_filters(SAMPLE_RATE, mel::N_FFT, config.num_mel_bins);
        let suppress_mask = suppress_mask(&config, tokens.no_timestamps, &device)?;
        let max_decode_tokens = engine.max_decode_tokens.min(config.max_target_positions / 2);

        tracing::info!(
            "Whisper model {} loaded in {:.2}s",
            engine.model,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            mel_filters,
            tokens,
            suppress_mask,
            max_decode_tokens,
        })
    }

    /// Transcribe 16kHz mono audio in [-1.0, 1.0].
    pub fn transcribe(&mut self, audio: &[f32]) -> Result<String> {
        let start_time = std::time::Instant::now();

        let mel = m::audio::pcm_to_mel(&self.config, audio, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;

        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < frames {
            let size = usize::min(frames - seek, m::N_FRAMES);
            let window = mel.narrow(2, seek, size)?;
            let decoded = self.decode_window(&window)?;
            seek += size;

            if decoded.is_silence() {
                tracing::debug!(seek, no_speech_prob = decoded.no_speech_prob, "skipping silent window");
                continue;
            }
            if !decoded.text.is_empty() {
                segments.push(decoded.text);
            }
        }

        let text = segments.join(" ");
        tracing::debug!(
            "Transcribed {:.2}s of audio in {:.2}s: '{}'",
            audio.len() as f64 / SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64(),
            text
        );
        Ok(text)
    }

    fn decode_window(&mut self, mel: &Tensor) -> Result<DecodedWindow> {
        let audio_features = self.model.encoder.forward(mel, true)?;

        let prompt = self.tokens.prompt();
        let mut tokens = prompt.clone();
        let mut sum_logprob = 0.0;
        let mut no_speech_prob = 0.0;

        for step in 0..self.max_decode_tokens {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, step == 0)?;

            if step == 0 {
                if let Some(no_speech) = self.tokens.no_speech {
                    let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                    no_speech_prob = softmax(&logits, 0)?.i(no_speech as usize)?.to_scalar::<f32>()? as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .broadcast_add(&self.suppress_mask)?;

            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            let prob = softmax(&logits, D::Minus1)?.i(next as usize)?.to_scalar::<f32>()? as f64;

            if next == self.tokens.eot {
                break;
            }
            if is_repetitive(&tokens[prompt.len()..], next) {
                tracing::debug!(token = next, "decoder is repeating itself, cutting the window short");
                break;
            }
            tokens.push(next);
            sum_logprob += prob.ln();
        }

        let generated = &tokens[prompt.len()..];
        let avg_logprob = if generated.is_empty() {
            0.0
        } else {
            sum_logprob / generated.len() as f64
        };
        let text = self
            .tokenizer
            .decode(generated, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?
            .trim()
            .to_string();

        Ok(DecodedWindow {
            text,
            avg_logprob,
            no_speech_prob,
        })
    }
}

/// Find the model files, downloading them if `model` is not a local directory.
async fn resolve_files(model: &str) -> Result<ModelFiles> {
    let dir = Path::new(model);
    if dir.is_dir() {
        let files = ModelFiles {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights: dir.join("model.safetensors"),
        };
        for path in [&files.config, &files.tokenizer, &files.weights] {
            if !path.is_file() {
                return Err(anyhow!("Model directory is missing {}", path.display()));
            }
        }
        return Ok(files);
    }

    use hf_hub::api::tokio::ApiBuilder;

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
    }
    let api = builder
        .build()
        .map_err(|e| anyhow!("Failed to create HuggingFace client: {}", e))?;

    tracing::info!("Fetching model files from {}", model);
    let repo = api.model(model.to_string());

    Ok(ModelFiles {
        config: fetch(&repo, model, "config.json").await?,
        tokenizer: fetch(&repo, model, "tokenizer.json").await?,
        weights: fetch(&repo, model, "model.safetensors").await?,
    })
}

async fn fetch(repo: &hf_hub::api::tokio::ApiRepo, model: &str, name: &str) -> Result<PathBuf> {
    repo.get(name)
        .await
        .map_err(|e| anyhow!("Failed to download {} from {}: {}", name, model, e))
}

fn suppress_mask(config: &Config, no_timestamps: u32, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..config.vocab_size as u32)
        .map(|token| {
            if config.suppress_tokens.contains(&token) || token == no_timestamps {
                f32::NEG_INFINITY
            } else {
                0.0
            }
        })
        .collect();
    Ok(Tensor::new(mask.as_slice(), device)?)
}

/// Whether appending `next` would make the tail of `tokens` loop.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 3 && tokens[n - 3..].iter().all(|&t| t == next) {
        return true;
    }
    if n >= 6 {
        let mut tail = tokens[n - 5..].to_vec();
        tail.push(next);
        if tail[..3] == tail[3..] {
            return true;
        }
    }
    false
}
