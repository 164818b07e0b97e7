//! Prompt conditioning
//!
//! Prompts arrive already tokenized. A weighted prompt scales each position's
//! input embedding and may splice in custom embedding rows (textual
//! inversion). That needs the encoder's embedding tables; encoders without
//! them receive the plain token ids instead.

use burn::prelude::*;
use tracing::debug;

use crate::error::{PipelineError, Result, ServiceKind};
use crate::services::{EmbeddingTables, TextEncoder};

/// CLIP context length
pub const PROMPT_LENGTH: usize = 77;

/// Token ids with per-position weights and optional custom embedding rows
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedPrompt {
    pub ids: Vec<u32>,
    pub weights: Vec<f32>,
    /// Replaces the table lookup for a position; scaled by its weight
    pub custom: Vec<Option<Vec<f32>>>,
}

impl WeightedPrompt {
    /// Unit weights and no custom rows
    pub fn from_ids(ids: Vec<u32>) -> Self {
        let len = ids.len();
        Self {
            ids,
            weights: vec![1.0; len],
            custom: vec![None; len],
        }
    }

    fn validate(&self) -> Result<()> {
        for (what, len) in [
            ("prompt ids", self.ids.len()),
            ("prompt weights", self.weights.len()),
            ("prompt embeddings", self.custom.len()),
        ] {
            if len != PROMPT_LENGTH {
                return Err(PipelineError::ShapeMismatch {
                    what,
                    expected: vec![PROMPT_LENGTH],
                    actual: vec![len],
                });
            }
        }
        Ok(())
    }

    /// Input embeddings `[77 * dim]`, row-major
    ///
    /// Positions without a custom row get `(token[id] + position[i]) * weight`.
    pub fn input_embeddings(&self, tables: &EmbeddingTables) -> Result<Vec<f32>> {
        self.validate()?;
        let dim = tables.dim;
        let mut out = Vec::with_capacity(PROMPT_LENGTH * dim);

        for (i, ((&id, &weight), custom)) in self
            .ids
            .iter()
            .zip(&self.weights)
            .zip(&self.custom)
            .enumerate()
        {
            match custom {
                Some(row) => {
                    if row.len() != dim {
                        return Err(PipelineError::ShapeMismatch {
                            what: "custom embedding row",
                            expected: vec![dim],
                            actual: vec![row.len()],
                        });
                    }
                    out.extend(row.iter().map(|v| v * weight));
                }
                None => {
                    let token = tables.token_row(id).ok_or_else(|| {
                        PipelineError::InvalidInput(format!(
                            "token id {id} outside a vocabulary of {}",
                            tables.vocab_size()
                        ))
                    })?;
                    let position = tables.position_row(i).ok_or_else(|| {
                        PipelineError::InvalidInput(format!(
                            "position table has {} rows, need {PROMPT_LENGTH}",
                            tables.positions()
                        ))
                    })?;
                    out.extend(token.iter().zip(position).map(|(t, p)| (t + p) * weight));
                }
            }
        }
        Ok(out)
    }
}

/// Prompt as handed to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// 77 token ids, padded by the tokenizer
    Tokens(Vec<u32>),
    Weighted(WeightedPrompt),
}

impl Prompt {
    pub fn ids(&self) -> &[u32] {
        match self {
            Self::Tokens(ids) => ids,
            Self::Weighted(p) => &p.ids,
        }
    }
}

/// Runs the text encoder on `prompt`, returning `[1, 77, dim]`
pub fn encode_prompt<B: Backend>(
    encoder: &dyn TextEncoder<B>,
    prompt: &Prompt,
    device: &B::Device,
) -> Result<Tensor<B, 3>> {
    let ids = prompt.ids();
    if ids.len() != PROMPT_LENGTH {
        return Err(PipelineError::ShapeMismatch {
            what: "prompt ids",
            expected: vec![PROMPT_LENGTH],
            actual: vec![ids.len()],
        });
    }

    let hidden = match (prompt, encoder.embedding_tables()) {
        (Prompt::Weighted(weighted), Some(tables)) => {
            let data = weighted.input_embeddings(tables)?;
            let embeddings =
                Tensor::from_data(TensorData::new(data, [1, PROMPT_LENGTH, tables.dim]), device);
            encoder
                .encode_embeddings(embeddings)
                .map_err(PipelineError::service(ServiceKind::TextEncoder))?
        }
        (Prompt::Weighted(_), None) => {
            debug!("text encoder has no embedding tables, encoding token ids");
            encoder
                .encode_ids(ids)
                .map_err(PipelineError::service(ServiceKind::TextEncoder))?
        }
        (Prompt::Tokens(_), _) => encoder
            .encode_ids(ids)
            .map_err(PipelineError::service(ServiceKind::TextEncoder))?,
    };

    let [batch, len, _] = hidden.dims();
    if batch != 1 || len != PROMPT_LENGTH {
        return Err(PipelineError::ShapeMismatch {
            what: "text embedding",
            expected: vec![1, PROMPT_LENGTH],
            actual: vec![batch, len],
        });
    }
    Ok(hidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::services::ServiceResult;
    use burn_ndarray::NdArray;
    use std::cell::RefCell;

    type TestBackend = NdArray<f32>;

    const DIM: usize = 2;

    fn tables() -> EmbeddingTables {
        EmbeddingTables {
            dim: DIM,
            // token k -> [k, 0]
            token: (0..10).flat_map(|k| [k as f32, 0.0]).collect(),
            // position i -> [0, i]
            position: (0..PROMPT_LENGTH).flat_map(|i| [0.0, i as f32]).collect(),
        }
    }

    struct RecordingEncoder {
        tables: Option<EmbeddingTables>,
        calls: RefCell<Vec<&'static str>>,
        last_embeddings: RefCell<Vec<f32>>,
    }

    impl RecordingEncoder {
        fn new(tables: Option<EmbeddingTables>) -> Self {
            Self {
                tables,
                calls: RefCell::new(Vec::new()),
                last_embeddings: RefCell::new(Vec::new()),
            }
        }
    }

    impl TextEncoder<TestBackend> for RecordingEncoder {
        fn encode_ids(&self, token_ids: &[u32]) -> ServiceResult<Tensor<TestBackend, 3>> {
            self.calls.borrow_mut().push("ids");
            let data: Vec<f32> = token_ids.iter().flat_map(|&t| [t as f32; DIM]).collect();
            Ok(Tensor::from_data(
                TensorData::new(data, [1, token_ids.len(), DIM]),
                &Default::default(),
            ))
        }

        fn encode_embeddings(
            &self,
            embeddings: Tensor<TestBackend, 3>,
        ) -> ServiceResult<Tensor<TestBackend, 3>> {
            self.calls.borrow_mut().push("embeddings");
            *self.last_embeddings.borrow_mut() = embeddings.clone().into_data().to_vec().unwrap();
            Ok(embeddings)
        }

        fn embedding_tables(&self) -> Option<&EmbeddingTables> {
            self.tables.as_ref()
        }
    }

    fn weighted() -> WeightedPrompt {
        let mut prompt = WeightedPrompt::from_ids((0..PROMPT_LENGTH as u32).map(|i| i % 10).collect());
        prompt.weights[1] = 1.5;
        prompt.custom[2] = Some(vec![7.0, 8.0]);
        prompt.weights[2] = 0.5;
        prompt
    }

    #[test]
    fn test_input_embeddings_fallback_rows() {
        let data = weighted().input_embeddings(&tables()).unwrap();
        assert_eq!(data.len(), PROMPT_LENGTH * DIM);
        // (token 0 + position 0) * 1
        assert_eq!(&data[0..2], &[0.0, 0.0]);
        // (token 1 + position 1) * 1.5
        assert_eq!(&data[2..4], &[1.5, 1.5]);
        // custom row * 0.5
        assert_eq!(&data[4..6], &[3.5, 4.0]);
        // (token 3 + position 3) * 1
        assert_eq!(&data[6..8], &[3.0, 3.0]);
    }

    #[test]
    fn test_weighted_prompt_uses_embedding_path() {
        let encoder = RecordingEncoder::new(Some(tables()));
        let out = encode_prompt::<TestBackend>(&encoder, &Prompt::Weighted(weighted()), &Default::default()).unwrap();
        assert_eq!(out.dims(), [1, PROMPT_LENGTH, DIM]);
        assert_eq!(*encoder.calls.borrow(), vec!["embeddings"]);
        assert_eq!(&encoder.last_embeddings.borrow()[2..4], &[1.5, 1.5]);
    }

    #[test]
    fn test_weighted_prompt_falls_back_to_ids() {
        let encoder = RecordingEncoder::new(None);
        encode_prompt::<TestBackend>(&encoder, &Prompt::Weighted(weighted()), &Default::default()).unwrap();
        assert_eq!(*encoder.calls.borrow(), vec!["ids"]);
    }

    #[test]
    fn test_rejects_bad_prompts() {
        let encoder = RecordingEncoder::new(Some(tables()));
        let short = Prompt::Tokens(vec![0; 10]);
        assert!(matches!(
            encode_prompt::<TestBackend>(&encoder, &short, &Default::default()),
            Err(PipelineError::ShapeMismatch { what: "prompt ids", .. })
        ));

        let mut bad_row = weighted();
        bad_row.custom[5] = Some(vec![1.0]);
        assert!(matches!(
            bad_row.input_embeddings(&tables()),
            Err(PipelineError::ShapeMismatch { what: "custom embedding row", .. })
        ));

        let mut oov = weighted();
        oov.ids[3] = 99;
        assert!(matches!(
            oov.input_embeddings(&tables()),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_service_failure_is_tagged() {
        struct Failing;
        impl TextEncoder<TestBackend> for Failing {
            fn encode_ids(&self, _: &[u32]) -> ServiceResult<Tensor<TestBackend, 3>> {
                Err(ServiceError::new("model not loaded"))
            }
        }
        let err = encode_prompt::<TestBackend>(
            &Failing,
            &Prompt::Tokens(vec![0; PROMPT_LENGTH]),
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Service { service: ServiceKind::TextEncoder, .. }
        ));
    }
}
