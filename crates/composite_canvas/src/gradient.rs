//! Color/alpha gradients for the mirror fade

use composite_core::{approximately, Color};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorKey {
    pub color: Color,
    pub time: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlphaKey {
    pub alpha: f32,
    pub time: f32,
}

/// Piecewise-linear gradient over `[0, 1]` with independent color and
/// alpha keys
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gradient {
    pub color_keys: Vec<ColorKey>,
    pub alpha_keys: Vec<AlphaKey>,
}

impl Default for Gradient {
    /// White, fading from opaque at 0 to transparent at 0.5
    fn default() -> Self {
        Self {
            color_keys: vec![ColorKey {
                color: Color::WHITE,
                time: 0.0,
            }],
            alpha_keys: vec![
                AlphaKey {
                    alpha: 1.0,
                    time: 0.0,
                },
                AlphaKey {
                    alpha: 0.0,
                    time: 0.5,
                },
            ],
        }
    }
}

fn interpolate<K: Copy, V>(
    keys: &[K],
    t: f32,
    time: impl Fn(&K) -> f32,
    mix: impl Fn(&K, &K, f32) -> V,
    value: impl Fn(&K) -> V,
    fallback: V,
) -> V {
    let mut sorted: Vec<K> = keys.to_vec();
    sorted.sort_by(|a, b| time(a).total_cmp(&time(b)));
    let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
        return fallback;
    };
    if t <= time(first) {
        return value(first);
    }
    if t >= time(last) {
        return value(last);
    }
    for pair in sorted.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if t <= time(b) {
            let span = time(b) - time(a);
            let f = if span <= f32::EPSILON { 1.0 } else { (t - time(a)) / span };
            return mix(a, b, f);
        }
    }
    value(last)
}

impl Gradient {
    pub fn evaluate(&self, t: f32) -> Color {
        let rgb = interpolate(
            &self.color_keys,
            t,
            |k| k.time,
            |a, b, f| a.color.lerp(&b.color, f),
            |k| k.color,
            Color::WHITE,
        );
        let alpha = interpolate(
            &self.alpha_keys,
            t,
            |k| k.time,
            |a, b, f| a.alpha + (b.alpha - a.alpha) * f,
            |k| k.alpha,
            1.0,
        );
        rgb.with_alpha(alpha)
    }

    /// Sorted, de-duplicated sample times: 0, 1 and every key time.
    pub fn sample_times(&self) -> Vec<f32> {
        let mut times: Vec<f32> = [0.0, 1.0]
            .into_iter()
            .chain(self.alpha_keys.iter().map(|k| k.time))
            .chain(self.color_keys.iter().map(|k| k.time))
            .map(|t| t.clamp(0.0, 1.0))
            .collect();
        times.sort_by(f32::total_cmp);
        times.dedup_by(|a, b| approximately(*a, *b));
        times
    }

    /// `(time, color)` at every sample time
    pub fn samples(&self) -> Vec<(f32, Color)> {
        self.sample_times()
            .into_iter()
            .map(|t| (t, self.evaluate(t)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_samples() {
        let samples = Gradient::default().samples();
        let times: Vec<f32> = samples.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![0.0, 0.5, 1.0]);
        assert_eq!(samples[0].1.a, 1.0);
        assert_eq!(samples[1].1.a, 0.0);
        assert_eq!(samples[2].1.a, 0.0);
    }

    #[test]
    fn test_evaluate_interpolates_between_keys() {
        let g = Gradient::default();
        assert!((g.evaluate(0.25).a - 0.5).abs() < 1e-6);
        assert_eq!(g.evaluate(0.25).r, 1.0);
    }

    #[test]
    fn test_empty_keys_fall_back_to_opaque_white() {
        let g = Gradient {
            color_keys: vec![],
            alpha_keys: vec![],
        };
        assert_eq!(g.evaluate(0.3), Color::WHITE);
    }
}
