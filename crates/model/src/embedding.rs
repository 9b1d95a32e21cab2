//! Learned per-site vectors appended to every encoder and decoder step.

use candle_core::{DType, Error, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

/// Lookup table shared by the encoder and the decoder.
#[derive(Debug, Clone)]
pub struct SiteEmbedding {
    table: Embedding,
    n_sites: usize,
}

impl SiteEmbedding {
    pub fn new(n_sites: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let table = candle_nn::embedding(n_sites, dim, vb)?;
        Ok(Self {
            table,
            n_sites,
        })
    }

    /// Maps site ids shaped `[batch]` to vectors shaped `[batch, dim]`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let batch = ids.dims1()?;
        if batch == 0 {
            return Err(Error::Msg("site ids must not be empty".into()));
        }
        let ids = match ids.dtype() {
            DType::U32 => ids.clone(),
            DType::U8 | DType::I64 => ids.to_dtype(DType::U32)?,
            other => {
                return Err(Error::Msg(format!(
                    "site ids must be integer typed (got {:?})",
                    other
                )))
            }
        };
        let largest = ids.max(0)?.to_scalar::<u32>()? as usize;
        if largest >= self.n_sites {
            return Err(Error::Msg(format!(
                "site id {} out of range for {} sites",
                largest, self.n_sites
            )));
        }
        self.table.forward(&ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn build(n_sites: usize, dim: usize) -> SiteEmbedding {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        SiteEmbedding::new(n_sites, dim, vb).unwrap()
    }

    #[test]
    fn looks_up_one_row_per_site() {
        let embedding = build(4, 3);
        let ids = Tensor::new(&[0u32, 3, 3], &Device::Cpu).unwrap();
        let vectors = embedding.forward(&ids).unwrap();
        assert_eq!(vectors.dims(), &[3, 3]);

        let rows = vectors.to_vec2::<f32>().unwrap();
        assert_eq!(rows[1], rows[2]);
    }

    #[test]
    fn rejects_unknown_site() {
        let embedding = build(2, 3);
        let ids = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        assert!(embedding.forward(&ids).is_err());
    }
}
