use rustfft::{num_traits, FftNum};

pub trait Float: FftNum + num_traits::Float + num_traits::FloatConst + std::iter::Sum {
    /// Lossy conversion from any primitive number. Unrepresentable values map to NaN.
    fn cast(x: impl num_traits::ToPrimitive) -> Self {
        <Self as num_traits::NumCast>::from(x).unwrap_or_else(Self::nan)
    }
}

impl<T: FftNum + num_traits::Float + num_traits::FloatConst + std::iter::Sum> Float for T {}
