use ndarray::{s, Array1, Array4, ArrayView1, ArrayView4, Axis, Zip};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{AugmentError, Augmentation, CutmixSampler, LabelMix, MixCoefficients};
use crate::config::TrainConfig;
use crate::utils::roll_axis0;

/// Rectangular cutmix region in pixel coordinates, `[x1, x2) x [y1, y2)`.
/// Corners may lie outside the image; only the overlap is masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutBox {
    pub x1: i64,
    pub x2: i64,
    pub y1: i64,
    pub y2: i64,
}

impl CutBox {
    /// Box for retain fraction `coeff`, with the center placed by the uniform
    /// draws `u_x`, `u_y` in [0, 1) so that the box stays inside the image.
    pub fn from_draws(height: usize, width: usize, coeff: f32, u_x: f32, u_y: f32) -> Self {
        let (height, width) = (height as f32, width as f32);
        let cut_ratio = (1.0 - coeff).max(0.0).sqrt();
        let cut_width = width * cut_ratio;
        let cut_height = height * cut_ratio;

        // Center is uniform in [cut_dim / 2, dim - cut_dim / 2)
        let center_x = (width - cut_width) * u_x + cut_width / 2.0;
        let center_y = (height - cut_height) * u_y + cut_height / 2.0;

        Self {
            x1: (center_x - cut_width / 2.0).round_ties_even() as i64,
            x2: (center_x + cut_width / 2.0).round_ties_even() as i64,
            y1: (center_y - cut_height / 2.0).round_ties_even() as i64,
            y2: (center_y + cut_height / 2.0).round_ties_even() as i64,
        }
    }

    fn clamp(lo: i64, hi: i64, dim: usize) -> (usize, usize) {
        let dim = dim as i64;
        let lo = lo.clamp(0, dim);
        let hi = hi.clamp(lo, dim);
        (lo as usize, hi as usize)
    }

    /// Column range covered inside an image of the given width
    pub fn columns(&self, width: usize) -> (usize, usize) {
        Self::clamp(self.x1, self.x2, width)
    }

    /// Row range covered inside an image of the given height
    pub fn rows(&self, height: usize) -> (usize, usize) {
        Self::clamp(self.y1, self.y2, height)
    }

    /// Fraction of the image's pixels covered by the mask
    pub fn mask_fraction(&self, height: usize, width: usize) -> f32 {
        if height == 0 || width == 0 {
            return 0.0;
        }
        let (x1, x2) = self.columns(width);
        let (y1, y2) = self.rows(height);
        ((x2 - x1) * (y2 - y1)) as f32 / (height * width) as f32
    }
}

/// Applies mixup and/or cutmix to NCHW image batches and builds the matching
/// label weighting.
#[derive(Debug, Clone)]
pub struct Augmenter {
    augmentation: Augmentation,
    cutmix: Option<CutmixSampler>,
    rng: SmallRng,
}

impl Augmenter {
    /// At least one technique must be enabled; cutmix needs its sampler.
    /// A sampler passed to a mixup-only augmenter is dropped.
    pub fn new(
        augmentation: Augmentation,
        cutmix: Option<CutmixSampler>,
        seed: Option<u64>,
    ) -> Result<Self, AugmentError> {
        if augmentation == Augmentation::None {
            return Err(AugmentError::NoAugmentation);
        }
        if augmentation.uses_cutmix() && cutmix.is_none() {
            return Err(AugmentError::MissingCutmixParams);
        }
        let cutmix = cutmix.filter(|_| augmentation.uses_cutmix());
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Ok(Self {
            augmentation,
            cutmix,
            rng,
        })
    }

    /// Builds the augmenter described by the configuration, if any technique is enabled.
    pub fn from_config(config: &TrainConfig) -> Result<Option<Self>, AugmentError> {
        let augmentation = Augmentation::from_flags(config.mixup_enabled, config.cutmix_enabled);
        if augmentation == Augmentation::None {
            return Ok(None);
        }
        let cutmix = if augmentation.uses_cutmix() {
            Some(CutmixSampler::from_params(
                config.cutmix_lambda_low,
                config.cutmix_lambda_high,
                config.cutmix_disable_prob,
            )?)
        } else {
            None
        };
        // Device-side stream, kept apart from the host stream used for mixup
        let seed = config.seed.map(|s| s.wrapping_add(1));
        Self::new(augmentation, cutmix, seed).map(Some)
    }

    pub fn augmentation(&self) -> Augmentation {
        self.augmentation
    }

    /// Augments a batch. `mixup_coeffs` are the host-sampled coefficients and
    /// must be present whenever mixup is enabled.
    pub fn augment(
        &mut self,
        images: ArrayView4<f32>,
        mixup_coeffs: Option<&Array1<f32>>,
    ) -> Result<(Array4<f32>, MixCoefficients), AugmentError> {
        let mut coeffs = MixCoefficients::default();

        let mut batch = if self.augmentation.uses_mixup() {
            let mixup = mixup_coeffs.ok_or(AugmentError::MissingMixupCoefficients)?;
            coeffs.mixup = Some(mixup.clone());
            mixup_images(images, mixup.view())?
        } else {
            images.to_owned()
        };

        if let Some(sampler) = &self.cutmix {
            let retain = sampler.sample(&mut self.rng);
            let u_x = self.rng.gen::<f32>();
            let u_y = self.rng.gen::<f32>();
            let (height, width) = (batch.len_of(Axis(2)), batch.len_of(Axis(3)));
            let cut_box = CutBox::from_draws(height, width, retain, u_x, u_y);
            let (cutmixed, coeff) = cutmix_images(batch.view(), &cut_box);
            batch = cutmixed;
            coeffs.cutmix = Some(coeff);
        }

        Ok((batch, coeffs))
    }

    /// Label branches and weights matching the coefficients returned by `augment`.
    pub fn mix_labels(
        &self,
        labels: &Array1<usize>,
        coeffs: &MixCoefficients,
    ) -> Result<LabelMix, AugmentError> {
        mix_labels(self.augmentation, labels, coeffs)
    }
}

/// Blends each image with the previous image of the batch (cyclic):
/// `c[i] * x[i] + (1 - c[i]) * x[i - 1]`.
pub fn mixup_images(
    images: ArrayView4<f32>,
    coeffs: ArrayView1<f32>,
) -> Result<Array4<f32>, AugmentError> {
    let n = images.len_of(Axis(0));
    if coeffs.len() != n {
        return Err(AugmentError::ShapeMismatch(format!(
            "{} mixup coefficients for a batch of {} images",
            coeffs.len(),
            n
        )));
    }

    let mut mixed = roll_axis0(images, 1);
    for (i, &c) in coeffs.iter().enumerate() {
        Zip::from(mixed.index_axis_mut(Axis(0), i))
            .and(images.index_axis(Axis(0), i))
            .for_each(|m, &x| *m = c * x + (1.0 - c) * *m);
    }
    Ok(mixed)
}

/// Replaces the box region of every image with the image two positions back
/// in the batch. Returns the cutmixed batch and the realized coefficient
/// `1 - mean(mask)`.
pub fn cutmix_images(images: ArrayView4<f32>, cut_box: &CutBox) -> (Array4<f32>, f32) {
    let (_, _, height, width) = images.dim();
    let (x1, x2) = cut_box.columns(width);
    let (y1, y2) = cut_box.rows(height);

    let mut out = images.to_owned();
    if x2 > x1 && y2 > y1 {
        let donor = roll_axis0(images, 2);
        out.slice_mut(s![.., .., y1..y2, x1..x2])
            .assign(&donor.slice(s![.., .., y1..y2, x1..x2]));
    }

    let coeff = 1.0 - cut_box.mask_fraction(height, width);
    (out, coeff)
}

/// Builds the label branches for one augmentation variant.
///
/// With both techniques each output image combines four source images: the
/// two cutmix halves are each a mixup of two images.
pub fn mix_labels(
    augmentation: Augmentation,
    labels: &Array1<usize>,
    coeffs: &MixCoefficients,
) -> Result<LabelMix, AugmentError> {
    match augmentation {
        Augmentation::Both => {
            let m = mixup_coefficients(coeffs, labels.len())?;
            let c = cutmix_coefficient(coeffs)?;
            let m_rolled = roll_axis0(m.view(), 2);
            Ok(LabelMix {
                labels: vec![
                    labels.clone(),
                    roll_axis0(labels.view(), 1),
                    roll_axis0(labels.view(), 2),
                    roll_axis0(labels.view(), 3),
                ],
                weights: vec![
                    m.mapv(|m| m * c),
                    m.mapv(|m| (1.0 - m) * c),
                    m_rolled.mapv(|m| m * (1.0 - c)),
                    m_rolled.mapv(|m| (1.0 - m) * (1.0 - c)),
                ],
            })
        }
        Augmentation::Mixup => {
            let m = mixup_coefficients(coeffs, labels.len())?;
            Ok(LabelMix {
                labels: vec![labels.clone(), roll_axis0(labels.view(), 1)],
                weights: vec![m.clone(), m.mapv(|m| 1.0 - m)],
            })
        }
        Augmentation::Cutmix => {
            let n = labels.len();
            let c = cutmix_coefficient(coeffs)?;
            Ok(LabelMix {
                labels: vec![labels.clone(), roll_axis0(labels.view(), 2)],
                weights: vec![Array1::from_elem(n, c), Array1::from_elem(n, 1.0 - c)],
            })
        }
        Augmentation::None => Err(AugmentError::NoAugmentation),
    }
}

fn mixup_coefficients(coeffs: &MixCoefficients, n: usize) -> Result<&Array1<f32>, AugmentError> {
    let m = coeffs
        .mixup
        .as_ref()
        .ok_or(AugmentError::MissingMixupCoefficients)?;
    if m.len() != n {
        return Err(AugmentError::ShapeMismatch(format!(
            "{} mixup coefficients for {} labels",
            m.len(),
            n
        )));
    }
    Ok(m)
}

fn cutmix_coefficient(coeffs: &MixCoefficients) -> Result<f32, AugmentError> {
    coeffs
        .cutmix
        .ok_or_else(|| AugmentError::InvalidParameter("cutmix coefficient missing".to_string()))
}
