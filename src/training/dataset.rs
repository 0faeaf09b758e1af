use ndarray::{s, Array1, Array4, Axis};
use ndarray_rand::RandomExt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset error: {0}")]
    Generic(String),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

/// NCHW images with one class label per image
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Array1<usize>,
}

impl Batch {
    pub fn new(images: Array4<f32>, labels: Array1<usize>) -> Result<Self, DatasetError> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(DatasetError::ShapeMismatch(format!(
                "{} images but {} labels",
                images.len_of(Axis(0)),
                labels.len()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Source of training batches. One call to `batches` is one epoch.
pub trait BatchSource {
    fn iterations_per_epoch(&self) -> usize;

    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_>;
}

/// In-memory image dataset batched with a fixed size (incomplete tail batches are dropped)
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Array4<f32>,
    labels: Array1<usize>,
    batch_size: usize,
}

impl Dataset {
    pub fn new(
        images: Array4<f32>,
        labels: Array1<usize>,
        batch_size: usize,
    ) -> Result<Self, DatasetError> {
        if batch_size == 0 {
            return Err(DatasetError::Generic("batch size must be positive".to_string()));
        }
        let Batch { images, labels } = Batch::new(images, labels)?;
        Ok(Self {
            images,
            labels,
            batch_size,
        })
    }

    /// Gaussian blobs around one random prototype image per class
    pub fn synthetic(
        num_samples: usize,
        input_shape: (usize, usize, usize),
        num_classes: usize,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, DatasetError> {
        if num_classes == 0 {
            return Err(DatasetError::Generic("need at least one class".to_string()));
        }
        let (c, h, w) = input_shape;
        let mut rng = SmallRng::seed_from_u64(seed);
        let unit = Normal::new(0.0f32, 1.0).map_err(|e| DatasetError::Generic(e.to_string()))?;
        let noise = Normal::new(0.0f32, 0.5).map_err(|e| DatasetError::Generic(e.to_string()))?;

        let prototypes = Array4::random_using((num_classes, c, h, w), unit, &mut rng);
        let labels: Array1<usize> = (0..num_samples)
            .map(|_| rng.gen_range(0..num_classes))
            .collect();
        let mut images = Array4::random_using((num_samples, c, h, w), noise, &mut rng);
        for (mut image, &label) in images.outer_iter_mut().zip(labels.iter()) {
            image += &prototypes.index_axis(Axis(0), label);
        }

        Self::new(images, labels, batch_size)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn input_shape(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }

    pub fn batch_iter(&self) -> BatchIterator<'_> {
        BatchIterator::new(self)
    }

    /// Like `batch_iter`, but yields the incomplete tail batch too
    pub fn batch_iter_with_remainder(&self) -> BatchIterator<'_> {
        BatchIterator {
            keep_remainder: true,
            ..BatchIterator::new(self)
        }
    }
}

impl BatchSource for Dataset {
    fn iterations_per_epoch(&self) -> usize {
        self.len() / self.batch_size
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.batch_iter())
    }
}

/// Iterator over training batches
pub struct BatchIterator<'a> {
    dataset: &'a Dataset,
    current_pos: usize,
    keep_remainder: bool,
}

impl<'a> BatchIterator<'a> {
    pub fn new(dataset: &'a Dataset) -> Self {
        Self {
            dataset,
            current_pos: 0,
            keep_remainder: false,
        }
    }
}

impl<'a> Iterator for BatchIterator<'a> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.dataset.len();
        let mut end = self.current_pos + self.dataset.batch_size;
        if end > len {
            if !self.keep_remainder || self.current_pos >= len {
                return None;
            }
            end = len;
        }

        let batch = Batch {
            images: self
                .dataset
                .images
                .slice(s![self.current_pos..end, .., .., ..])
                .to_owned(),
            labels: self.dataset.labels.slice(s![self.current_pos..end]).to_owned(),
        };
        self.current_pos = end;
        Some(batch)
    }
}
