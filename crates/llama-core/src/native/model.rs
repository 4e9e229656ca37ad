//! Owned `llama_model` plus vocabulary and chat-template helpers.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::ptr;

use tracing::{debug, info};

use crate::chat::ChatMessage;
use crate::error::{LlamaError, Result};
use crate::params::{ParamError, Params};

/// Model-loading options recognised in the initialisation map.
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Layers to offload to GPU. -1 = all.
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: -1,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

impl ModelParams {
    pub fn from_params(params: &Params) -> std::result::Result<Self, ParamError> {
        let d = Self::default();
        Ok(Self {
            n_gpu_layers: params.get_i32("n_gpu_layers")?.unwrap_or(d.n_gpu_layers),
            use_mmap: params.get_bool("use_mmap")?.unwrap_or(d.use_mmap),
            use_mlock: params.get_bool("use_mlock")?.unwrap_or(d.use_mlock),
        })
    }
}

pub struct LlamaModel {
    ptr: *mut llama_sys::llama_model,
}

// Safety: llama_model is read-only after load.
unsafe impl Send for LlamaModel {}
unsafe impl Sync for LlamaModel {}

type ProgressSink<'a> = &'a mut dyn FnMut(f32);

unsafe extern "C" fn progress_trampoline(progress: f32, user_data: *mut c_void) -> bool {
    let sink = unsafe { &mut *(user_data as *mut ProgressSink<'_>) };
    sink(progress);
    true
}

impl LlamaModel {
    /// Load a GGUF model, reporting progress as whole percentages.
    /// Repeated identical percentages are collapsed.
    pub fn load(path: &Path, params: &ModelParams, on_progress: &mut dyn FnMut(u32)) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| LlamaError::load(path, "path is not valid UTF-8"))?;
        let c_path =
            CString::new(path_str).map_err(|_| LlamaError::load(path, "path contains a NUL byte"))?;

        let mut last = None;
        let mut forward = |fraction: f32| {
            let pct = (fraction.clamp(0.0, 1.0) * 100.0).round() as u32;
            if last != Some(pct) {
                last = Some(pct);
                on_progress(pct);
            }
        };
        let mut sink: ProgressSink<'_> = &mut forward;

        let mut raw = unsafe { llama_sys::llama_model_default_params() };
        raw.n_gpu_layers = params.n_gpu_layers;
        raw.use_mmap = params.use_mmap;
        raw.use_mlock = params.use_mlock;
        raw.progress_callback = Some(progress_trampoline);
        raw.progress_callback_user_data = &mut sink as *mut ProgressSink<'_> as *mut c_void;

        info!(path = %path.display(), "Loading model…");
        let model = unsafe { llama_sys::llama_model_load_from_file(c_path.as_ptr(), raw) };
        if model.is_null() {
            return Err(LlamaError::load(path, "llama_model_load_from_file returned null"));
        }

        info!(path = %path.display(), "Model loaded");
        Ok(Self { ptr: model })
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_model {
        self.ptr
    }

    fn vocab(&self) -> *const llama_sys::llama_vocab {
        unsafe { llama_sys::llama_model_get_vocab(self.ptr) }
    }

    /// End-of-generation (EOS, EOT and friends).
    pub fn is_eog(&self, token: i32) -> bool {
        unsafe { llama_sys::llama_vocab_is_eog(self.vocab(), token) }
    }

    //  Metadata

    pub fn desc(&self) -> String {
        read_c_buf(256, |buf, len| unsafe { llama_sys::llama_model_desc(self.ptr, buf, len) })
            .unwrap_or_default()
    }

    pub fn size(&self) -> u64 {
        unsafe { llama_sys::llama_model_size(self.ptr) }
    }

    pub fn n_params(&self) -> u64 {
        unsafe { llama_sys::llama_model_n_params(self.ptr) }
    }

    pub fn n_ctx_train(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_ctx_train(self.ptr) }
    }

    /// Built-in chat template, if any.
    pub fn chat_template(&self) -> Option<String> {
        unsafe {
            let p = llama_sys::llama_model_chat_template(self.ptr, ptr::null());
            if p.is_null() {
                None
            } else {
                Some(CStr::from_ptr(p).to_string_lossy().into_owned())
            }
        }
    }

    /// All string-valued metadata.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let n = unsafe { llama_sys::llama_model_meta_count(self.ptr) };
        (0..n)
            .filter_map(|i| {
                let key = read_c_buf(256, |buf, len| unsafe {
                    llama_sys::llama_model_meta_key_by_index(self.ptr, i, buf, len)
                })?;
                let val = read_c_buf(1024, |buf, len| unsafe {
                    llama_sys::llama_model_meta_val_str_by_index(self.ptr, i, buf, len)
                })?;
                Some((key, val))
            })
            .collect()
    }

    //  Tokens

    pub fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<i32>> {
        let c_text = CString::new(text)
            .map_err(|_| LlamaError::TokenizationFailed("text contains a NUL byte".into()))?;
        let call = |out: *mut i32, cap: i32| unsafe {
            llama_sys::llama_tokenize(
                self.vocab(),
                c_text.as_ptr(),
                text.len() as i32,
                out,
                cap,
                add_special,
                true,
            )
        };

        // A first pass with no buffer reports the required size, negated.
        let needed = -call(ptr::null_mut(), 0);
        let mut tokens = vec![0i32; needed.max(0) as usize];
        let n = call(tokens.as_mut_ptr(), tokens.len() as i32);
        if n < 0 {
            return Err(LlamaError::TokenizationFailed(format!(
                "llama_tokenize returned {n}"
            )));
        }
        tokens.truncate(n as usize);
        Ok(tokens)
    }

    /// Raw bytes of one token. A piece may end inside a UTF-8 sequence.
    pub fn token_bytes(&self, token: i32) -> Vec<u8> {
        let call = |buf: &mut Vec<u8>| unsafe {
            llama_sys::llama_token_to_piece(
                self.vocab(),
                token,
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as i32,
                0,
                false,
            )
        };
        let mut buf = vec![0u8; 64];
        let mut n = call(&mut buf);
        if n < 0 {
            buf.resize((-n) as usize, 0);
            n = call(&mut buf);
        }
        buf.truncate(n.max(0) as usize);
        buf
    }

    pub fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        let call = |buf: &mut Vec<u8>| unsafe {
            llama_sys::llama_detokenize(
                self.vocab(),
                tokens.as_ptr(),
                tokens.len() as i32,
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as i32,
                false,
                false,
            )
        };
        let mut buf = vec![0u8; tokens.len() * 8 + 16];
        let mut n = call(&mut buf);
        if n < 0 {
            buf.resize((-n) as usize, 0);
            n = call(&mut buf);
        }
        if n < 0 {
            return Err(LlamaError::TokenizationFailed(format!(
                "llama_detokenize returned {n}"
            )));
        }
        buf.truncate(n as usize);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    //  Chat

    /// Render `messages` with `template`, or the model's own template when
    /// `None`. Always appends the assistant turn opener.
    pub fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        template: Option<&str>,
    ) -> Result<String> {
        let template = match template {
            Some(t) => Some(t.to_owned()),
            None => self.chat_template(),
        };
        let c_tmpl = template
            .map(CString::new)
            .transpose()
            .map_err(|_| LlamaError::FormatFailed("template contains a NUL byte".into()))?;
        let tmpl_ptr = c_tmpl.as_ref().map_or(ptr::null(), |c| c.as_ptr());

        let c_strings = messages
            .iter()
            .map(|m| Ok((CString::new(m.role.as_str())?, CString::new(m.content.as_str())?)))
            .collect::<std::result::Result<Vec<_>, std::ffi::NulError>>()
            .map_err(|_| LlamaError::FormatFailed("message contains a NUL byte".into()))?;
        let c_msgs: Vec<llama_sys::llama_chat_message> = c_strings
            .iter()
            .map(|(role, content)| llama_sys::llama_chat_message {
                role: role.as_ptr(),
                content: content.as_ptr(),
            })
            .collect();

        let call = |buf: &mut Vec<u8>| unsafe {
            llama_sys::llama_chat_apply_template(
                tmpl_ptr,
                c_msgs.as_ptr(),
                c_msgs.len(),
                true,
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as i32,
            )
        };

        let mut buf = vec![0u8; 1024];
        let mut n = call(&mut buf);
        if n as usize > buf.len() {
            buf.resize(n as usize, 0);
            n = call(&mut buf);
        }
        if n < 0 {
            return Err(LlamaError::FormatFailed(
                "chat template is not supported by llama.cpp".into(),
            ));
        }
        buf.truncate(n as usize);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama model");
            unsafe { llama_sys::llama_model_free(self.ptr) }
        }
    }
}

/// Call a C function that writes a string into `(buf, len)` and returns its
/// length, growing the buffer once if it was too small.
fn read_c_buf(initial: usize, f: impl Fn(*mut c_char, usize) -> i32) -> Option<String> {
    let mut buf = vec![0u8; initial];
    let mut n = f(buf.as_mut_ptr() as *mut c_char, buf.len());
    if n >= 0 && n as usize >= buf.len() {
        buf.resize(n as usize + 1, 0);
        n = f(buf.as_mut_ptr() as *mut c_char, buf.len());
    }
    if n < 0 {
        return None;
    }
    buf.truncate(n as usize);
    Some(String::from_utf8_lossy(&buf).into_owned())
}
