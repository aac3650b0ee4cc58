use std::cmp::Ordering;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::SamplingParams;

/// How the next token is picked from a logits vector.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    Greedy,
    Temperature { temperature: f32 },
    TopK { k: usize, temperature: f32 },
    TopP { p: f32, temperature: f32 },
    TopKTopP { k: usize, p: f32, temperature: f32 },
}

impl Strategy {
    pub fn from_params(params: &SamplingParams) -> Self {
        if params.temperature <= 0.0 {
            return Self::Greedy;
        }
        let temperature = params.temperature as f32;
        match (params.top_k, params.top_p) {
            (Some(k), Some(p)) => Self::TopKTopP { k, p: p as f32, temperature },
            (Some(k), None) => Self::TopK { k, temperature },
            (None, Some(p)) => Self::TopP { p: p as f32, temperature },
            (None, None) => Self::Temperature { temperature },
        }
    }
}

/// Token sampler with its own PRNG, seeded per generation when a seed is set.
pub struct Sampler {
    strategy: Strategy,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: &SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            strategy: Strategy::from_params(params),
            rng,
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Sample a token id from a 1-D logits tensor.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits: Vec<f32> = logits.to_dtype(DType::F32)?.to_device(&Device::Cpu)?.to_vec1()?;
        Ok(self.sample_slice(&logits))
    }

    pub fn sample_slice(&mut self, logits: &[f32]) -> u32 {
        match self.strategy.clone() {
            Strategy::Greedy => argmax(logits),
            Strategy::Temperature { temperature } => {
                self.draw(&scale(logits, temperature))
            }
            Strategy::TopK { k, temperature } => {
                self.draw(&keep_top_k(&scale(logits, temperature), k))
            }
            Strategy::TopP { p, temperature } => {
                self.draw(&keep_top_p(&scale(logits, temperature), p))
            }
            Strategy::TopKTopP { k, p, temperature } => {
                let filtered = keep_top_k(&scale(logits, temperature), k);
                self.draw(&keep_top_p(&filtered, p))
            }
        }
    }

    fn draw(&mut self, logits: &[f32]) -> u32 {
        let probs = softmax(logits);
        let target: f32 = self.rng.random();
        let mut cumulative = 0.0f32;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= target {
                return i as u32;
            }
        }
        probs.len().saturating_sub(1) as u32
    }
}

/// Penalise logits of tokens seen in `recent`.
pub fn apply_repeat_penalty(logits: &Tensor, penalty: f32, recent: &[u32]) -> Result<Tensor> {
    if penalty == 1.0 || recent.is_empty() {
        return Ok(logits.clone());
    }
    let device = logits.device();
    let mut values: Vec<f32> = logits.to_dtype(DType::F32)?.to_device(&Device::Cpu)?.to_vec1()?;
    penalize(&mut values, penalty, recent);
    Ok(Tensor::from_vec(values, logits.shape(), device)?)
}

fn penalize(values: &mut [f32], penalty: f32, recent: &[u32]) {
    for &token in recent {
        if let Some(v) = values.get_mut(token as usize) {
            *v = if *v > 0.0 { *v / penalty } else { *v * penalty };
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn by_value_desc(a: &f32, b: &f32) -> Ordering {
    b.partial_cmp(a).unwrap_or(Ordering::Equal)
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| by_value_desc(a, b))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn scale(logits: &[f32], temperature: f32) -> Vec<f32> {
    logits.iter().map(|l| l / temperature).collect()
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum = exps.iter().sum::<f32>().max(f32::EPSILON);
    exps.into_iter().map(|e| e / sum).collect()
}

fn ranked(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| by_value_desc(&values[a], &values[b]));
    order
}

fn keep_top_k(logits: &[f32], k: usize) -> Vec<f32> {
    let mut out = vec![f32::NEG_INFINITY; logits.len()];
    for idx in ranked(logits).into_iter().take(k.max(1)) {
        out[idx] = logits[idx];
    }
    out
}

fn keep_top_p(logits: &[f32], p: f32) -> Vec<f32> {
    let probs = softmax(logits);
    let mut out = vec![f32::NEG_INFINITY; logits.len()];
    let mut mass = 0.0f32;
    for idx in ranked(&probs) {
        if mass >= p && mass > 0.0 {
            break;
        }
        out[idx] = logits[idx];
        mass += probs[idx];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f64, top_p: Option<f64>, top_k: Option<usize>) -> SamplingParams {
        SamplingParams {
            temperature,
            top_p,
            top_k,
            seed: Some(1234),
            ..Default::default()
        }
    }

    #[test]
    fn non_positive_temperature_is_greedy() {
        assert_eq!(Strategy::from_params(&params(0.0, Some(0.9), Some(5))), Strategy::Greedy);
        assert_eq!(Strategy::from_params(&params(-1.0, None, None)), Strategy::Greedy);
    }

    #[test]
    fn strategy_follows_filters() {
        assert!(matches!(Strategy::from_params(&params(0.7, None, None)), Strategy::Temperature { .. }));
        assert!(matches!(Strategy::from_params(&params(0.7, None, Some(40))), Strategy::TopK { k: 40, .. }));
        assert!(matches!(Strategy::from_params(&params(0.7, Some(0.9), None)), Strategy::TopP { .. }));
        assert!(matches!(
            Strategy::from_params(&params(0.7, Some(0.9), Some(40))),
            Strategy::TopKTopP { k: 40, .. }
        ));
    }

    #[test]
    fn greedy_picks_highest_logit() {
        let mut sampler = Sampler::new(&params(0.0, None, None));
        assert_eq!(sampler.sample_slice(&[1.0, 3.0, 2.0, 0.5]), 1);
    }

    #[test]
    fn seeded_samplers_agree() {
        let logits = [0.5, 0.4, 0.3, 0.2, 0.1];
        let mut a = Sampler::new(&params(1.0, None, None));
        let mut b = Sampler::new(&params(1.0, None, None));
        let draws_a: Vec<u32> = (0..16).map(|_| a.sample_slice(&logits)).collect();
        let draws_b: Vec<u32> = (0..16).map(|_| b.sample_slice(&logits)).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn top_k_one_is_deterministic() {
        let mut sampler = Sampler::new(&params(1.5, None, Some(1)));
        for _ in 0..10 {
            assert_eq!(sampler.sample_slice(&[0.1, 2.0, 1.9]), 1);
        }
    }

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(&[1000.0, 1000.0, 0.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] < 1e-5);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn top_k_keeps_only_k_entries() {
        let kept = keep_top_k(&[1.0, 5.0, 3.0, 2.0, 4.0], 2);
        assert_eq!(kept[1], 5.0);
        assert_eq!(kept[4], 4.0);
        assert_eq!(kept.iter().filter(|v| v.is_finite()).count(), 2);
    }

    #[test]
    fn top_p_keeps_dominant_token_and_full_mass_keeps_all() {
        let kept = keep_top_p(&[-100.0, 100.0, -100.0], 0.9);
        assert!(kept[1].is_finite());
        assert!(!kept[0].is_finite());

        let all = keep_top_p(&[1.0, 2.0, 3.0], 1.0);
        assert!(all.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn repeat_penalty_shrinks_seen_tokens() {
        let mut values = vec![2.0, -2.0, 1.0];
        penalize(&mut values, 2.0, &[0, 1, 7]);
        assert_eq!(values, vec![1.0, -4.0, 1.0]);
    }
}
