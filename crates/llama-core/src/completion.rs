//! Completion requests, results, and the bookkeeping shared by every
//! engine's generation loop.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{LlamaError, Result};
use crate::params::{ParamError, Params};

//  Sampling

/// Sampling configuration read from the completion map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub repeat_last_n: i32,
    pub seed: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn from_params(params: &Params) -> std::result::Result<Self, ParamError> {
        let d = Self::default();
        Ok(Self {
            temperature: params.get_f32("temperature")?.unwrap_or(d.temperature),
            top_k: params.get_i32("top_k")?.unwrap_or(d.top_k),
            top_p: params.get_f32("top_p")?.unwrap_or(d.top_p),
            min_p: params.get_f32("min_p")?.unwrap_or(d.min_p),
            repeat_penalty: params.get_f32("penalty_repeat")?.unwrap_or(d.repeat_penalty),
            frequency_penalty: params.get_f32("penalty_freq")?.unwrap_or(d.frequency_penalty),
            presence_penalty: params
                .get_f32("penalty_present")?
                .unwrap_or(d.presence_penalty),
            repeat_last_n: params.get_i32("penalty_last_n")?.unwrap_or(d.repeat_last_n),
            seed: params.get_u32("seed")?,
        })
    }
}

//  Request

/// The engine-facing view of a completion parameter map.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Maximum tokens to predict; negative means no limit besides the
    /// context window.
    pub n_predict: i32,
    pub stop: Vec<String>,
    pub sampling: SamplingParams,
}

impl CompletionRequest {
    pub fn from_params(params: &Params) -> Result<Self> {
        let invalid = |e: ParamError| LlamaError::InferenceFailed(e.to_string());

        let prompt = params
            .get_str("prompt")
            .map_err(invalid)?
            .ok_or_else(|| LlamaError::InferenceFailed("missing required parameter 'prompt'".into()))?
            .to_owned();

        let stop = params
            .get_str_list("stop")
            .map_err(invalid)?
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            prompt,
            n_predict: params.get_i32("n_predict").map_err(invalid)?.unwrap_or(-1),
            stop,
            sampling: SamplingParams::from_params(params).map_err(invalid)?,
        })
    }
}

//  Result

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-generation token.
    Stop,
    /// Hit `n_predict` or the context window.
    Length,
    /// Matched a stop word.
    StopWord(String),
    /// Stopped by the caller.
    Cancelled,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::StopWord(w) => write!(f, "stop_word:{w}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timings {
    pub prompt_n: u32,
    pub prompt_ms: f64,
    pub predicted_n: u32,
    pub predicted_ms: f64,
}

impl Timings {
    /// Prompt processing speed (tokens/s).
    pub fn prompt_per_second(&self) -> f64 {
        if self.prompt_ms > 0.0 {
            self.prompt_n as f64 / (self.prompt_ms / 1000.0)
        } else {
            0.0
        }
    }

    /// Generation speed (tokens/s).
    pub fn predicted_per_second(&self) -> f64 {
        if self.predicted_ms > 0.0 {
            self.predicted_n as f64 / (self.predicted_ms / 1000.0)
        } else {
            0.0
        }
    }
}

/// Outcome of one completion call.
///
/// `text` is exactly the concatenation of the fragments handed to the token
/// callback, in order; `fragments` is how many there were.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub fragments: usize,
    pub tokens_predicted: u32,
    pub tokens_evaluated: u32,
    pub finish_reason: FinishReason,
    pub timings: Timings,
}

impl Completion {
    pub fn interrupted(&self) -> bool {
        self.finish_reason == FinishReason::Cancelled
    }

    /// Render as the host-facing result map.
    pub fn to_params(&self) -> Params {
        let stopping_word = match &self.finish_reason {
            FinishReason::StopWord(w) => w.clone(),
            _ => String::new(),
        };
        let t = &self.timings;
        let timings = Params::new()
            .with("prompt_n", t.prompt_n)
            .with("prompt_ms", t.prompt_ms)
            .with("prompt_per_second", t.prompt_per_second())
            .with("predicted_n", t.predicted_n)
            .with("predicted_ms", t.predicted_ms)
            .with("predicted_per_second", t.predicted_per_second());

        Params::new()
            .with("text", self.text.as_str())
            .with("fragments", self.fragments as i64)
            .with("tokens_predicted", self.tokens_predicted)
            .with("tokens_evaluated", self.tokens_evaluated)
            .with("stopped_eos", self.finish_reason == FinishReason::Stop)
            .with("stopped_word", matches!(self.finish_reason, FinishReason::StopWord(_)))
            .with("stopped_limit", self.finish_reason == FinishReason::Length)
            .with("stopping_word", stopping_word)
            .with("interrupted", self.interrupted())
            .with("finish_reason", self.finish_reason.to_string())
            .with("timings", timings)
    }
}

//  Generation bookkeeping

/// Tracks one in-flight generation: relays fragments to the caller,
/// enforces the token budget and stop words, and watches the cancel flag.
///
/// Engines call [`Generation::check`] before sampling each unit and
/// [`Generation::push`] with every decoded piece.
pub struct Generation<'a> {
    request: &'a CompletionRequest,
    on_token: &'a mut dyn FnMut(&str),
    cancel: &'a CancelToken,
    text: String,
    // Undelivered tail that may still grow into a stop word.
    held: String,
    fragments: usize,
    predicted: u32,
    started: Instant,
}

impl<'a> Generation<'a> {
    pub fn new(
        request: &'a CompletionRequest,
        on_token: &'a mut dyn FnMut(&str),
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            request,
            on_token,
            cancel,
            text: String::new(),
            held: String::new(),
            fragments: 0,
            predicted: 0,
            started: Instant::now(),
        }
    }

    /// Reason to stop before producing another unit, if any.
    pub fn check(&self) -> Option<FinishReason> {
        if self.cancel.is_cancelled() {
            debug!(predicted = self.predicted, "Generation cancelled");
            return Some(FinishReason::Cancelled);
        }
        if self.request.n_predict >= 0 && self.predicted >= self.request.n_predict as u32 {
            return Some(FinishReason::Length);
        }
        None
    }

    /// Record one predicted unit whose decoded text is `piece`.
    ///
    /// Returns `Some` when a stop word was matched; the text before the stop
    /// word is still delivered. A tail that could be the start of a stop
    /// word is held back until the next piece settles it.
    pub fn push(&mut self, piece: &str) -> Option<FinishReason> {
        self.predicted += 1;
        self.deliver(piece)
    }

    /// Like [`push`](Self::push) but without counting a predicted unit,
    /// for text left over once generation has ended.
    pub fn deliver(&mut self, piece: &str) -> Option<FinishReason> {
        let mut candidate = std::mem::take(&mut self.held);
        candidate.push_str(piece);

        let request = self.request;
        let hit = request
            .stop
            .iter()
            .filter_map(|word| candidate.find(word.as_str()).map(|at| (at, word)))
            .min_by_key(|(at, _)| *at);

        if let Some((at, word)) = hit {
            self.emit(&candidate[..at]);
            return Some(FinishReason::StopWord(word.clone()));
        }

        let keep = partial_stop_len(&candidate, &request.stop);
        let split = candidate.len() - keep;
        self.emit(&candidate[..split]);
        self.held = candidate[split..].to_owned();
        None
    }

    /// Record a predicted unit that produced no text (e.g. a control token).
    pub fn push_silent(&mut self) {
        self.predicted += 1;
    }

    fn emit(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        (self.on_token)(fragment);
        self.text.push_str(fragment);
        self.fragments += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Close the generation. Any held-back tail is delivered first, since it
    /// can no longer complete a stop word.
    pub fn finish(mut self, reason: FinishReason, prompt_n: u32, prompt_ms: f64) -> Completion {
        let held = std::mem::take(&mut self.held);
        self.emit(&held);
        let predicted_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        Completion {
            text: self.text,
            fragments: self.fragments,
            tokens_predicted: self.predicted,
            tokens_evaluated: prompt_n,
            finish_reason: reason,
            timings: Timings {
                prompt_n,
                prompt_ms,
                predicted_n: self.predicted,
                predicted_ms,
            },
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of one
/// of `stop`.
fn partial_stop_len(text: &str, stop: &[String]) -> usize {
    stop.iter()
        .filter_map(|word| {
            let max = word.len().saturating_sub(1).min(text.len());
            (1..=max)
                .rev()
                .filter(|&n| text.is_char_boundary(text.len() - n))
                .find(|&n| word.starts_with(&text[text.len() - n..]))
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(stop: &[&str], n_predict: i32) -> CompletionRequest {
        CompletionRequest {
            prompt: "p".into(),
            n_predict,
            stop: stop.iter().map(|s| s.to_string()).collect(),
            sampling: SamplingParams::default(),
        }
    }

    #[test]
    fn request_requires_prompt() {
        let err = CompletionRequest::from_params(&Params::new()).unwrap_err();
        assert!(matches!(err, LlamaError::InferenceFailed(ref m) if m.contains("prompt")));

        let err = CompletionRequest::from_params(&Params::new().with("prompt", 3)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Inference);
    }

    #[test]
    fn request_reads_known_keys_and_ignores_others() {
        let p = Params::new()
            .with("prompt", "Hi")
            .with("n_predict", 16)
            .with("stop", vec!["\n", ""])
            .with("temperature", 0)
            .with("seed", 7)
            .with("some_future_knob", "whatever");
        let req = CompletionRequest::from_params(&p).unwrap();
        assert_eq!(req.prompt, "Hi");
        assert_eq!(req.n_predict, 16);
        assert_eq!(req.stop, vec!["\n".to_string()]);
        assert_eq!(req.sampling.temperature, 0.0);
        assert_eq!(req.sampling.seed, Some(7));
        assert_eq!(req.sampling.top_k, 40);
    }

    #[test]
    fn generation_relays_fragments_in_order() {
        let req = request(&[], -1);
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let mut sink = |s: &str| seen.push(s.to_string());
        let mut g = Generation::new(&req, &mut sink, &cancel);
        assert!(g.push("Hel").is_none());
        assert!(g.push("lo").is_none());
        g.push_silent();
        let c = g.finish(FinishReason::Stop, 3, 1.0);
        assert_eq!(seen, vec!["Hel", "lo"]);
        assert_eq!(c.text, "Hello");
        assert_eq!(c.fragments, 2);
        assert_eq!(c.tokens_predicted, 3);
    }

    #[test]
    fn stop_word_inside_piece_delivers_the_head() {
        let req = request(&["\n\n"], -1);
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let mut sink = |s: &str| seen.push(s.to_string());
        let mut g = Generation::new(&req, &mut sink, &cancel);
        g.push("One");
        let reason = g.push(" two\n\nUser:");
        assert_eq!(reason, Some(FinishReason::StopWord("\n\n".into())));
        let c = g.finish(reason.unwrap(), 1, 0.0);
        assert_eq!(c.text, "One two");
        assert_eq!(seen.concat(), c.text);
    }

    #[test]
    fn stop_word_spanning_pieces() {
        let req = request(&["</s>"], -1);
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let mut sink = |s: &str| seen.push(s.to_string());
        let mut g = Generation::new(&req, &mut sink, &cancel);
        assert!(g.push("ok</").is_none());
        assert_eq!(g.text(), "ok");
        assert!(g.push("s>").is_some());
        let c = g.finish(FinishReason::StopWord("</s>".into()), 1, 0.0);
        assert_eq!(c.text, "ok");
        assert_eq!(seen, vec!["ok"]);
    }

    #[test]
    fn held_tail_is_released_when_it_stops_matching() {
        let req = request(&[" User:"], -1);
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let mut sink = |s: &str| seen.push(s.to_string());
        let mut g = Generation::new(&req, &mut sink, &cancel);
        assert!(g.push("Yes ").is_none());
        assert!(g.push("Us").is_none());
        assert_eq!(g.text(), "Yes");
        assert!(g.push("ually").is_none());
        assert_eq!(g.text(), "Yes Usually");
        assert!(g.push(" Us").is_none());
        let c = g.finish(FinishReason::Stop, 1, 0.0);
        assert_eq!(c.text, "Yes Usually Us");
        assert_eq!(seen.concat(), c.text);
    }

    #[test]
    fn partial_stop_respects_char_boundaries() {
        let stop = vec!["éa".to_string(), "xyz".to_string()];
        assert_eq!(partial_stop_len("caf\u{e9}", &stop), 2);
        assert_eq!(partial_stop_len("..xy", &stop), 2);
        assert_eq!(partial_stop_len("xyz", &stop), 0);
        assert_eq!(partial_stop_len("abc", &[]), 0);
    }

    #[test]
    fn delivered_text_is_not_counted() {
        let req = request(&["##"], -1);
        let cancel = CancelToken::new();
        let mut sink = |_: &str| {};
        let mut g = Generation::new(&req, &mut sink, &cancel);
        g.push("a");
        assert!(g.deliver("b").is_none());
        assert_eq!(g.deliver("c##"), Some(FinishReason::StopWord("##".into())));
        let c = g.finish(FinishReason::Stop, 1, 0.0);
        assert_eq!(c.text, "abc");
        assert_eq!(c.tokens_predicted, 1);
    }

    #[test]
    fn budget_and_cancel_are_checked() {
        let req = request(&[], 2);
        let cancel = CancelToken::new();
        let mut sink = |_: &str| {};
        let mut g = Generation::new(&req, &mut sink, &cancel);
        assert!(g.check().is_none());
        g.push("a");
        g.push("b");
        assert_eq!(g.check(), Some(FinishReason::Length));

        let unlimited = request(&[], -1);
        let mut sink = |_: &str| {};
        let g = Generation::new(&unlimited, &mut sink, &cancel);
        cancel.cancel();
        assert_eq!(g.check(), Some(FinishReason::Cancelled));
    }

    #[test]
    fn result_map_flags() {
        let c = Completion {
            text: "hi".into(),
            fragments: 1,
            tokens_predicted: 2,
            tokens_evaluated: 5,
            finish_reason: FinishReason::StopWord("###".into()),
            timings: Timings::default(),
        };
        let p = c.to_params();
        assert_eq!(p.get_str("text").unwrap(), Some("hi"));
        assert_eq!(p.get_bool("stopped_word").unwrap(), Some(true));
        assert_eq!(p.get_bool("stopped_eos").unwrap(), Some(false));
        assert_eq!(p.get_str("stopping_word").unwrap(), Some("###"));
        assert_eq!(p.get_bool("interrupted").unwrap(), Some(false));
        assert!(p.contains_key("timings"));
    }
}
