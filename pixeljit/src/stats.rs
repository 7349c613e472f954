//! The statistics oracle.
//!
//! Computed eagerly from the input image before lowering begins, then
//! answered as constants while statistic-referencing syntax is lowered.
//! Variance and covariance are population moments; skew and kurtosis
//! are the third and fourth standardised moments.

use crate::image::ImageView;

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    sum: f64,
    mean: f64,
    min: f64,
    max: f64,
    variance: f64,
    skew: f64,
    kurtosis: f64,
}

/// Precomputed image statistics.
#[derive(Debug)]
pub struct Stats {
    overall: Moments,
    per_channel: Vec<Moments>,
    covariance: Vec<f64>,
    channels: usize,
}

impl Stats {
    /// Scan the image once per pass and memoise every statistic.
    pub fn new(im: &ImageView<'_>) -> Self {
        let channels = im.channels;
        let mut per_channel = vec![
            Moments {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                ..Moments::default()
            };
            channels
        ];
        let mut overall = Moments {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Moments::default()
        };

        let pixels = (im.width * im.height * im.frames) as f64;
        let samples = pixels * channels as f64;

        for t in 0..im.frames {
            for y in 0..im.height {
                for x in 0..im.width {
                    for (c, m) in per_channel.iter_mut().enumerate() {
                        let v = im.at(x, y, t, c) as f64;
                        m.sum += v;
                        m.min = m.min.min(v);
                        m.max = m.max.max(v);
                        overall.sum += v;
                        overall.min = overall.min.min(v);
                        overall.max = overall.max.max(v);
                    }
                }
            }
        }
        for m in per_channel.iter_mut() {
            m.mean = m.sum / pixels;
        }
        overall.mean = overall.sum / samples;

        // central moments need the means, so a second pass
        let mut covariance = vec![0.0f64; channels * channels];
        for t in 0..im.frames {
            for y in 0..im.height {
                for x in 0..im.width {
                    for c in 0..channels {
                        let d = im.at(x, y, t, c) as f64 - per_channel[c].mean;
                        per_channel[c].variance += d * d;
                        per_channel[c].skew += d * d * d;
                        per_channel[c].kurtosis += d * d * d * d;

                        let dv = im.at(x, y, t, c) as f64 - overall.mean;
                        overall.variance += dv * dv;
                        overall.skew += dv * dv * dv;
                        overall.kurtosis += dv * dv * dv * dv;

                        for c2 in 0..channels {
                            let d2 = im.at(x, y, t, c2) as f64 - per_channel[c2].mean;
                            covariance[c * channels + c2] += d * d2;
                        }
                    }
                }
            }
        }
        for m in per_channel.iter_mut() {
            finish_moments(m, pixels);
        }
        finish_moments(&mut overall, samples);
        for cov in covariance.iter_mut() {
            *cov /= pixels;
        }

        Self {
            overall,
            per_channel,
            covariance,
            channels,
        }
    }

    /// Channel count the per-channel accessors accept.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Mean over every sample.
    pub fn mean(&self) -> f32 {
        self.overall.mean as f32
    }

    /// Sum of every sample.
    pub fn sum(&self) -> f32 {
        self.overall.sum as f32
    }

    /// Smallest sample.
    pub fn minimum(&self) -> f32 {
        self.overall.min as f32
    }

    /// Largest sample.
    pub fn maximum(&self) -> f32 {
        self.overall.max as f32
    }

    /// Population variance over every sample.
    pub fn variance(&self) -> f32 {
        self.overall.variance as f32
    }

    /// Standard deviation over every sample.
    pub fn stddev(&self) -> f32 {
        (self.overall.variance as f32).sqrt()
    }

    /// Standardised third moment.
    pub fn skew(&self) -> f32 {
        self.overall.skew as f32
    }

    /// Standardised fourth moment.
    pub fn kurtosis(&self) -> f32 {
        self.overall.kurtosis as f32
    }

    /// Per-channel mean.
    pub fn mean_of(&self, c: usize) -> f32 {
        self.per_channel[c].mean as f32
    }

    /// Per-channel sum.
    pub fn sum_of(&self, c: usize) -> f32 {
        self.per_channel[c].sum as f32
    }

    /// Per-channel minimum.
    pub fn minimum_of(&self, c: usize) -> f32 {
        self.per_channel[c].min as f32
    }

    /// Per-channel maximum.
    pub fn maximum_of(&self, c: usize) -> f32 {
        self.per_channel[c].max as f32
    }

    /// Per-channel variance.
    pub fn variance_of(&self, c: usize) -> f32 {
        self.per_channel[c].variance as f32
    }

    /// Per-channel standard deviation.
    pub fn stddev_of(&self, c: usize) -> f32 {
        (self.per_channel[c].variance as f32).sqrt()
    }

    /// Per-channel skew.
    pub fn skew_of(&self, c: usize) -> f32 {
        self.per_channel[c].skew as f32
    }

    /// Per-channel kurtosis.
    pub fn kurtosis_of(&self, c: usize) -> f32 {
        self.per_channel[c].kurtosis as f32
    }

    /// Covariance between two channels.
    pub fn covariance(&self, c1: usize, c2: usize) -> f32 {
        self.covariance[c1 * self.channels + c2] as f32
    }
}

fn finish_moments(m: &mut Moments, n: f64) {
    m.variance /= n;
    let sigma = m.variance.sqrt();
    if sigma > 0.0 {
        m.skew /= n * sigma * sigma * sigma;
        m.kurtosis /= n * sigma * sigma * sigma * sigma;
    } else {
        m.skew = 0.0;
        m.kurtosis = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuf;

    // 4x1x1x3 image with per-channel values {0,1,2,3} + c
    fn small() -> ImageBuf {
        let mut im = ImageBuf::new(4, 1, 1, 3);
        im.fill_with(|x, _, _, c| x as f32 + c as f32);
        im
    }

    #[test]
    fn per_channel_moments_match_closed_forms() {
        let im = small();
        let s = Stats::new(&im.view());
        assert_eq!(s.mean_of(0), 1.5);
        assert_eq!(s.mean_of(2), 3.5);
        assert_eq!(s.minimum_of(1), 1.0);
        assert_eq!(s.maximum_of(1), 4.0);
        // population variance of {0,1,2,3} is 1.25
        assert!((s.variance_of(0) - 1.25).abs() < 1e-6);
        // symmetric data has zero skew
        assert!(s.skew_of(0).abs() < 1e-6);
    }

    #[test]
    fn overall_moments_cover_every_sample() {
        let im = small();
        let s = Stats::new(&im.view());
        assert_eq!(s.mean(), 2.5);
        assert_eq!(s.minimum(), 0.0);
        assert_eq!(s.maximum(), 5.0);
        assert_eq!(s.sum(), 30.0);
    }

    #[test]
    fn channels_shifted_by_a_constant_covary_like_the_base() {
        let im = small();
        let s = Stats::new(&im.view());
        // channel k is channel 0 plus a constant, so all covariances
        // equal the base variance
        let v = s.variance_of(0);
        assert!((s.covariance(0, 1) - v).abs() < 1e-6);
        assert!((s.covariance(1, 2) - v).abs() < 1e-6);
        assert!((s.covariance(0, 0) - v).abs() < 1e-6);
    }
}
