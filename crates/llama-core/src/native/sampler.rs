//! Sampler chains built from [`SamplingParams`].

use super::context::LlamaContext;
use crate::completion::SamplingParams;

pub struct SamplerChain {
    ptr: *mut llama_sys::llama_sampler,
}

unsafe impl Send for SamplerChain {}

impl SamplerChain {
    /// Penalties, then truncation (top-k, top-p, min-p), then either
    /// temperature plus a seeded draw or greedy selection at temperature 0.
    pub fn from_params(p: &SamplingParams) -> Self {
        let params = llama_sys::llama_sampler_chain_params { no_perf: true };
        let mut chain = Self {
            ptr: unsafe { llama_sys::llama_sampler_chain_init(params) },
        };

        if p.repeat_penalty != 1.0 || p.frequency_penalty != 0.0 || p.presence_penalty != 0.0 {
            chain.add(unsafe {
                llama_sys::llama_sampler_init_penalties(
                    p.repeat_last_n,
                    p.repeat_penalty,
                    p.frequency_penalty,
                    p.presence_penalty,
                )
            });
        }
        if p.top_k > 0 {
            chain.add(unsafe { llama_sys::llama_sampler_init_top_k(p.top_k) });
        }
        if p.top_p < 1.0 {
            chain.add(unsafe { llama_sys::llama_sampler_init_top_p(p.top_p, 1) });
        }
        if p.min_p > 0.0 {
            chain.add(unsafe { llama_sys::llama_sampler_init_min_p(p.min_p, 1) });
        }

        if p.temperature > 0.0 {
            // LLAMA_DEFAULT_SEED picks a random seed
            let seed = p.seed.unwrap_or(u32::MAX);
            chain.add(unsafe { llama_sys::llama_sampler_init_temp(p.temperature) });
            chain.add(unsafe { llama_sys::llama_sampler_init_dist(seed) });
        } else {
            chain.add(unsafe { llama_sys::llama_sampler_init_greedy() });
        }
        chain
    }

    fn add(&mut self, sampler: *mut llama_sys::llama_sampler) {
        unsafe { llama_sys::llama_sampler_chain_add(self.ptr, sampler) }
    }

    /// Sample from the logits at batch index `idx` and accept the result.
    pub fn sample(&mut self, ctx: &LlamaContext, idx: i32) -> i32 {
        unsafe { llama_sys::llama_sampler_sample(self.ptr, ctx.as_ptr(), idx) }
    }
}

impl Drop for SamplerChain {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { llama_sys::llama_sampler_free(self.ptr) }
        }
    }
}
