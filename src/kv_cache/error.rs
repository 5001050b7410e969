use thiserror::Error;

/// Errors from the KV cache store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache position budget exceeded: need {needed}, budget {budget}")]
    PositionBudgetExceeded { needed: usize, budget: usize },

    #[error("layer {layer} out of range (stage holds {layers})")]
    LayerOutOfRange { layer: usize, layers: usize },

    #[error("slot range [{offset}, {offset}+{slots}) exceeds cache width {width}")]
    SlotOutOfRange {
        offset: usize,
        slots: usize,
        width: usize,
    },

    #[error("reorder index {index} out of range for cache of {size} slots")]
    InvalidReorderIndex { index: usize, size: usize },

    #[error("source shape {actual:?} does not match cache slice shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("prefix cache is not seeded")]
    PrefixNotSeeded,

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
