//! [`InferenceCapability`] over the Cactus C runtime (`libcactus`).
//!
//! Only built with the `native` feature; `build.rs` adds the link flags.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::capability::InferenceCapability;
use crate::config::{BridgeConfig, ModelDescriptor};
use crate::fetch::ModelFetcher;
use crate::types::{
    ChatTurn, CompletionParams, CompletionResult, DownloadProgress, EmbeddingResult,
    GenerationMetrics, InitParams, ModelInfo, ToolCall, TranscriptionParams, TranscriptionResult,
};

const RESPONSE_BUFFER_SIZE: usize = 64 * 1024;
const EMBEDDING_BUFFER_SIZE: usize = 8192;

type TokenCallbackFn = extern "C" fn(*const c_char, u32, *mut c_void);

extern "C" {
    fn cactus_init(model_path: *const c_char, context_size: usize) -> *mut c_void;

    fn cactus_complete(
        model: *mut c_void,
        messages_json: *const c_char,
        response_buffer: *mut c_char,
        buffer_size: usize,
        options_json: *const c_char,
        tools_json: *const c_char,
        callback: Option<TokenCallbackFn>,
        user_data: *mut c_void,
    ) -> c_int;

    fn cactus_transcribe(
        model: *mut c_void,
        audio_file_path: *const c_char,
        prompt: *const c_char,
        response_buffer: *mut c_char,
        buffer_size: usize,
        options_json: *const c_char,
        callback: Option<TokenCallbackFn>,
        user_data: *mut c_void,
    ) -> c_int;

    fn cactus_embed(
        model: *mut c_void,
        text: *const c_char,
        embeddings_buffer: *mut f32,
        buffer_size: usize,
        embedding_dim: *mut usize,
    ) -> c_int;

    fn cactus_destroy(model: *mut c_void);
}

/// Owned runtime model pointer, destroyed on drop.
struct ModelHandle {
    raw: *mut c_void,
    slug: String,
}

// the runtime allows a model to be used from any thread, one call at a time;
// the capability's mutex provides the one-at-a-time part
unsafe impl Send for ModelHandle {}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        debug!(slug = %self.slug, "destroying native model");
        unsafe { cactus_destroy(self.raw) };
    }
}

extern "C" fn token_trampoline(token: *const c_char, _token_id: u32, user_data: *mut c_void) {
    if token.is_null() || user_data.is_null() {
        return;
    }
    let callback = unsafe { &mut *(user_data as *mut &mut dyn FnMut(&str)) };
    let token = unsafe { CStr::from_ptr(token) }.to_string_lossy();
    callback(&token);
}

/// Completion envelope written into the response buffer.
#[derive(Debug, Deserialize)]
struct NativeCompletion {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    function_calls: Vec<NativeFunctionCall>,
    #[serde(default)]
    time_to_first_token_ms: f64,
    #[serde(default)]
    total_time_ms: f64,
    #[serde(default)]
    tokens_per_second: f64,
    #[serde(default)]
    prefill_tokens: u64,
    #[serde(default)]
    decode_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct NativeFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl NativeFunctionCall {
    fn into_tool_call(self) -> ToolCall {
        // some models emit arguments as a JSON string
        let arguments = match self.arguments {
            Value::Object(map) => map,
            Value::String(raw) => serde_json::from_str::<Map<String, Value>>(&raw).unwrap_or_default(),
            _ => Map::new(),
        };
        ToolCall {
            name: self.name,
            arguments,
        }
    }
}

pub struct NativeCapability {
    models_root: PathBuf,
    catalog: Vec<ModelDescriptor>,
    fetcher: ModelFetcher,
    model: Mutex<Option<ModelHandle>>,
}

impl NativeCapability {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            models_root: config.models_dir.clone(),
            catalog: config.catalog.clone(),
            fetcher: ModelFetcher::new(config.download_base_url.clone()),
            model: Mutex::new(None),
        }
    }

    fn with_model<T>(&self, f: impl FnOnce(*mut c_void) -> Result<T>) -> Result<T> {
        let guard = self.model.lock();
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("native runtime has no model loaded"))?;
        f(handle.raw)
    }
}

fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value).with_context(|| format!("{what} contains an interior NUL byte"))
}

fn path_c_string(path: &Path) -> Result<CString> {
    c_string(&path.to_string_lossy(), "path")
}

fn read_response(buffer: &[u8]) -> Result<String> {
    let text = CStr::from_bytes_until_nul(buffer)
        .map_err(|_| anyhow!("native response was not NUL terminated"))?;
    Ok(text.to_string_lossy().into_owned())
}

impl InferenceCapability for NativeCapability {
    fn name(&self) -> &str {
        "native"
    }

    fn download_model(
        &self,
        slug: &str,
        target_dir: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<()> {
        let descriptor = self
            .catalog
            .iter()
            .find(|d| d.slug == slug)
            .ok_or_else(|| anyhow!("unknown model slug: {slug}"))?;
        self.fetcher.fetch(descriptor, target_dir, on_progress)
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.catalog.iter().map(ModelDescriptor::info).collect())
    }

    fn initialize(&self, params: &InitParams) -> Result<()> {
        let path = params
            .model_path
            .clone()
            .unwrap_or_else(|| self.models_root.join(&params.model_slug));
        if !path.exists() {
            bail!("model not found at {}", path.display());
        }

        let c_path = path_c_string(&path)?;
        let raw = unsafe { cactus_init(c_path.as_ptr(), params.context_size as usize) };
        if raw.is_null() {
            bail!("cactus_init failed for {}", path.display());
        }

        let mut slot = self.model.lock();
        // dropping the previous handle releases it
        *slot = Some(ModelHandle {
            raw,
            slug: params.model_slug.clone(),
        });
        info!(slug = %params.model_slug, path = %path.display(), "native model initialized");
        Ok(())
    }

    fn generate_completion(
        &self,
        turns: &[ChatTurn],
        params: &CompletionParams,
        on_token: Option<&mut dyn FnMut(&str)>,
    ) -> Result<CompletionResult> {
        let messages = c_string(&serde_json::to_string(turns)?, "messages")?;
        let options = c_string(&serde_json::to_string(params)?, "options")?;
        let mut buffer = vec![0u8; RESPONSE_BUFFER_SIZE];

        let status = self.with_model(|raw| {
            let status = match on_token {
                Some(callback) => {
                    let mut callback: &mut dyn FnMut(&str) = callback;
                    let user_data = &mut callback as *mut &mut dyn FnMut(&str) as *mut c_void;
                    unsafe {
                        cactus_complete(
                            raw,
                            messages.as_ptr(),
                            buffer.as_mut_ptr() as *mut c_char,
                            buffer.len(),
                            options.as_ptr(),
                            ptr::null(),
                            Some(token_trampoline),
                            user_data,
                        )
                    }
                }
                None => unsafe {
                    cactus_complete(
                        raw,
                        messages.as_ptr(),
                        buffer.as_mut_ptr() as *mut c_char,
                        buffer.len(),
                        options.as_ptr(),
                        ptr::null(),
                        None,
                        ptr::null_mut(),
                    )
                },
            };
            Ok(status)
        })?;

        let raw_response = read_response(&buffer)?;
        let parsed: NativeCompletion = serde_json::from_str(&raw_response)
            .with_context(|| format!("unexpected completion response: {raw_response}"))?;
        if status < 0 || !parsed.success {
            bail!(
                "{}",
                parsed
                    .error
                    .unwrap_or_else(|| format!("cactus_complete returned {status}"))
            );
        }

        Ok(CompletionResult {
            success: true,
            response: parsed.response,
            metrics: GenerationMetrics {
                time_to_first_token_ms: parsed.time_to_first_token_ms,
                total_time_ms: parsed.total_time_ms,
                tokens_per_second: parsed.tokens_per_second,
                prefill_tokens: parsed.prefill_tokens,
                decode_tokens: parsed.decode_tokens,
                total_tokens: parsed.total_tokens,
            },
            tool_calls: parsed
                .function_calls
                .into_iter()
                .map(NativeFunctionCall::into_tool_call)
                .collect(),
        })
    }

    fn transcribe(
        &self,
        audio_path: &Path,
        prompt: &str,
        params: &TranscriptionParams,
    ) -> Result<TranscriptionResult> {
        if !audio_path.exists() {
            bail!("audio file not found: {}", audio_path.display());
        }
        let c_audio = path_c_string(audio_path)?;
        let c_prompt = c_string(prompt, "prompt")?;
        let options = c_string(&serde_json::to_string(params)?, "options")?;
        let mut buffer = vec![0u8; RESPONSE_BUFFER_SIZE];

        let status = self.with_model(|raw| {
            Ok(unsafe {
                cactus_transcribe(
                    raw,
                    c_audio.as_ptr(),
                    c_prompt.as_ptr(),
                    buffer.as_mut_ptr() as *mut c_char,
                    buffer.len(),
                    options.as_ptr(),
                    None,
                    ptr::null_mut(),
                )
            })
        })?;

        let raw_response = read_response(&buffer)?;
        let parsed: NativeCompletion = serde_json::from_str(&raw_response)
            .with_context(|| format!("unexpected transcription response: {raw_response}"))?;
        if status < 0 || !parsed.success {
            bail!(
                "{}",
                parsed
                    .error
                    .unwrap_or_else(|| format!("cactus_transcribe returned {status}"))
            );
        }

        Ok(TranscriptionResult {
            success: true,
            text: parsed.response,
        })
    }

    fn generate_embedding(&self, text: &str) -> Result<EmbeddingResult> {
        let c_text = c_string(text, "text")?;
        let mut buffer = vec![0f32; EMBEDDING_BUFFER_SIZE];
        let mut dimensions = 0usize;

        let status = self.with_model(|raw| {
            Ok(unsafe {
                cactus_embed(
                    raw,
                    c_text.as_ptr(),
                    buffer.as_mut_ptr(),
                    buffer.len() * std::mem::size_of::<f32>(),
                    &mut dimensions,
                )
            })
        })?;
        if status < 0 {
            bail!("cactus_embed returned {status}");
        }
        if dimensions > buffer.len() {
            bail!("embedding of {dimensions} dimensions exceeds buffer");
        }

        buffer.truncate(dimensions);
        Ok(EmbeddingResult {
            success: true,
            embeddings: buffer.into_iter().map(f64::from).collect(),
        })
    }

    fn unload(&self) -> Result<()> {
        if let Some(handle) = self.model.lock().take() {
            info!(slug = %handle.slug, "unloading native model");
        }
        Ok(())
    }
}
