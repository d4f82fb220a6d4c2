use crate::error::CocaError;

/// Shape of an image batch laid out as `[batch, height, width, channels]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    /// Number of patches the image is split into, remainders are dropped.
    ///
    /// Fails when the count, plus the class embedding position, does not fit in
    /// a `usize`.
    pub fn num_patches(&self, patch_size: usize) -> Result<usize, CocaError> {
        let rows = self.height.checked_div(patch_size);
        let cols = self.width.checked_div(patch_size);
        rows.zip(cols)
            .and_then(|(rows, cols)| rows.checked_mul(cols))
            .filter(|n| n.checked_add(1).is_some())
            .ok_or_else(|| CocaError::InvalidShape {
                name: "Image",
                reason: format!("patch count overflows with patch size {patch_size}"),
                actual: self.dims().to_vec(),
            })
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.height, self.width, self.channels]
    }
}

/// Shape of a tokenized text batch laid out as `[batch, sequence_length]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextShape {
    pub batch: usize,
    pub seq_len: usize,
}

impl TextShape {
    /// Sequence length once the classification token is appended.
    pub fn augmented_len(&self) -> Result<usize, CocaError> {
        self.seq_len
            .checked_add(1)
            .ok_or_else(|| CocaError::InvalidShape {
                name: "Text",
                reason: "no room left for the classification token".to_string(),
                actual: self.dims().to_vec(),
            })
    }

    pub fn dims(&self) -> [usize; 2] {
        [self.batch, self.seq_len]
    }
}

/// Shape of a `[batch, seq_len, width]` feature sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceShape {
    pub batch: usize,
    pub seq_len: usize,
    pub width: usize,
}

impl SequenceShape {
    pub fn new(batch: usize, seq_len: usize, width: usize) -> Self {
        Self {
            batch,
            seq_len,
            width,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.batch, self.seq_len, self.width]
    }
}

/// Validate the `[images, texts]` shape pair handed to the model build.
///
/// The checks run in a fixed order: number of shapes, image rank, text rank,
/// the batch sizes and finally empty or overflowing dimensions.
pub fn parse_input_shapes<S: AsRef<[usize]>>(
    input_shapes: &[S],
) -> Result<(ImageShape, TextShape), CocaError> {
    let [images, texts] = input_shapes else {
        return Err(CocaError::ShapeCount(input_shapes.len()));
    };
    let (images, texts) = (images.as_ref(), texts.as_ref());

    let &[batch, height, width, channels] = images else {
        return Err(CocaError::ShapeRank {
            name: "Image",
            layout: "[batch_size, height, width, channels]",
            actual: images.to_vec(),
        });
    };

    let &[text_batch, seq_len] = texts else {
        return Err(CocaError::ShapeRank {
            name: "Text",
            layout: "[batch_size, context_length]",
            actual: texts.to_vec(),
        });
    };

    if batch != text_batch {
        return Err(CocaError::BatchMismatch {
            images: batch,
            texts: text_batch,
        });
    }

    let non_empty = |name, dims: &[usize]| {
        if dims.contains(&0) {
            return Err(CocaError::InvalidShape {
                name,
                reason: "every dimension must be greater than zero".to_string(),
                actual: dims.to_vec(),
            });
        }
        Ok(())
    };
    non_empty("Image", images)?;
    non_empty("Text", texts)?;

    let texts = TextShape {
        batch: text_batch,
        seq_len,
    };
    texts.augmented_len()?;

    Ok((
        ImageShape {
            batch,
            height,
            width,
            channels,
        },
        texts,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_shapes() -> Result<(), CocaError> {
        let (images, texts) = parse_input_shapes(&[vec![8, 224, 224, 3], vec![8, 77]])?;
        assert_eq!(images.dims(), [8, 224, 224, 3]);
        assert_eq!(texts.dims(), [8, 77]);
        assert_eq!(images.num_patches(16)?, 196);
        assert_eq!(images.num_patches(18)?, 144);
        assert_eq!(texts.augmented_len()?, 78);
        Ok(())
    }

    #[test]
    fn test_shape_count() {
        let one: &[&[usize]] = &[&[8, 224, 224, 3]];
        assert!(matches!(
            parse_input_shapes(one),
            Err(CocaError::ShapeCount(1))
        ));

        let three: &[&[usize]] = &[&[8, 224, 224, 3], &[8, 77], &[8, 77]];
        assert!(matches!(
            parse_input_shapes(three),
            Err(CocaError::ShapeCount(3))
        ));

        let none: &[&[usize]] = &[];
        assert!(matches!(
            parse_input_shapes(none),
            Err(CocaError::ShapeCount(0))
        ));
    }

    #[test]
    fn test_shape_rank() {
        let res = parse_input_shapes(&[vec![8, 224, 224], vec![8, 77]]);
        assert!(matches!(res, Err(CocaError::ShapeRank { name: "Image", .. })));

        let res = parse_input_shapes(&[vec![8, 224, 224, 3], vec![8, 77, 512]]);
        assert!(matches!(res, Err(CocaError::ShapeRank { name: "Text", .. })));
    }

    #[test]
    fn test_image_rank_checked_before_text_rank() {
        let res = parse_input_shapes(&[vec![8, 224], vec![8]]);
        assert!(matches!(res, Err(CocaError::ShapeRank { name: "Image", .. })));
    }

    #[test]
    fn test_batch_mismatch() {
        let res = parse_input_shapes(&[vec![8, 224, 224, 3], vec![16, 77]]);
        assert!(matches!(
            res,
            Err(CocaError::BatchMismatch {
                images: 8,
                texts: 16
            })
        ));
    }

    #[test]
    fn test_error_message_names_shape() {
        let err = parse_input_shapes(&[vec![8, 224, 224], vec![8, 77]]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("[batch_size, height, width, channels]"));
        assert!(msg.contains("[8, 224, 224]"));
    }

    #[test]
    fn test_empty_dimensions_rejected() {
        let res = parse_input_shapes(&[vec![0, 8, 8, 3], vec![0, 3]]);
        assert!(matches!(res, Err(CocaError::InvalidShape { name: "Image", .. })));

        let res = parse_input_shapes(&[vec![1, 8, 8, 3], vec![1, 0]]);
        assert!(matches!(res, Err(CocaError::InvalidShape { name: "Text", .. })));

        let res = parse_input_shapes(&[vec![1, 8, 8, 0], vec![1, 4]]);
        assert!(matches!(res, Err(CocaError::InvalidShape { name: "Image", .. })));
    }

    #[test]
    fn test_overflowing_dimensions_rejected() {
        let err = parse_input_shapes(&[vec![1, 8, 8, 3], vec![1, usize::MAX]]).unwrap_err();
        assert!(matches!(err, CocaError::InvalidShape { name: "Text", .. }));
        assert!(err.to_string().contains(&format!("[1, {}]", usize::MAX)));

        let (images, _) = parse_input_shapes(&[vec![1, 1 << 40, 1 << 40, 3], vec![1, 4]])
            .expect("valid ranks and batch");
        assert!(matches!(
            images.num_patches(16),
            Err(CocaError::InvalidShape { name: "Image", .. })
        ));
        assert!(images.num_patches(0).is_err());
    }
}
