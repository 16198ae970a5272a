//! Hammer pattern expansion.
//!
//! A pattern description is a string of `v` (victim), `a` (aggressor) and
//! `x` (random victim gap) tokens, e.g. `"va"` for an n-sided pattern or
//! `"avax"` for aggressor pairs spread over a random area. The description
//! is repeated until it contains the requested number of aggressors and is
//! expanded into a dense bit sequence that the flip finders lay over
//! consecutive DRAM rows.

use thiserror::Error;

use crate::util::Rng;

/// Errors produced while expanding a pattern description.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// The description contains no tokens
    #[error("hammer pattern must not be empty")]
    Empty,
    /// The description contains a character other than v, a, x
    #[error("invalid token '{0}' in hammer pattern (expected 'v', 'a' or 'x')")]
    InvalidToken(char),
    /// Aggressors were requested but the description has no `a` token
    #[error("hammer pattern needs at least one aggressor token")]
    NoAggressors,
    /// The random area cannot hold the expanded pattern
    #[error("random_pattern_area {area} is smaller than the expanded pattern length {len}")]
    AreaTooSmall {
        /// Configured random area in rows
        area: u64,
        /// Length of the expanded pattern in rows
        len: u64,
    },
}

/// A dense victim/aggressor sequence expanded from a textual description.
///
/// `false` is a victim row, `true` an aggressor row. The expansion may
/// contain more aggressors than requested when the request is not a multiple
/// of the description's aggressor count; callers read the effective count
/// back via [`HammerPattern::aggressors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HammerPattern {
    description: String,
    bits: Vec<bool>,
}

impl HammerPattern {
    /// Expands `description` until it holds at least `aggressor_rows`
    /// aggressors.
    ///
    /// Each `x` token becomes a run of victims; the run lengths are drawn
    /// from `rng` so that the expanded pattern spans exactly
    /// `random_pattern_area` rows. A trailing victim is appended when the
    /// expansion would end in an aggressor. `aggressor_rows == 0` yields an
    /// empty pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] for empty or malformed descriptions and
    /// when the random area is smaller than the expanded pattern.
    pub fn expand(
        description: &str,
        aggressor_rows: u32,
        random_pattern_area: u64,
        rng: &mut Rng,
    ) -> Result<Self, PatternError> {
        if description.is_empty() {
            return Err(PatternError::Empty);
        }
        if let Some(bad) = description.chars().find(|c| !matches!(c, 'v' | 'a' | 'x')) {
            return Err(PatternError::InvalidToken(bad));
        }

        let pattern = |bits| HammerPattern {
            description: description.to_string(),
            bits,
        };

        if aggressor_rows == 0 {
            return Ok(pattern(vec![]));
        }

        let aggs_per_period = description.chars().filter(|&c| c == 'a').count() as u32;
        if aggs_per_period == 0 {
            return Err(PatternError::NoAggressors);
        }
        let periods = aggressor_rows.div_ceil(aggs_per_period) as usize;

        let x_per_period = description.chars().filter(|&c| c == 'x').count();
        let extras = if x_per_period > 0 {
            // every x slot holds at least one victim; the remaining area is
            // distributed randomly over the slots
            let slots = (periods * description.len()) as u64;
            let needed = random_pattern_area
                .checked_sub(slots)
                .ok_or(PatternError::AreaTooSmall {
                    area: random_pattern_area,
                    len: slots,
                })?;
            rng.split_sum(needed, periods * x_per_period)
        } else {
            vec![]
        };

        let mut bits = Vec::new();
        let mut x_index = 0;
        for _ in 0..periods {
            for token in description.chars() {
                match token {
                    'v' => bits.push(false),
                    'a' => bits.push(true),
                    _ => {
                        for _ in 0..1 + extras[x_index] {
                            bits.push(false);
                        }
                        x_index += 1;
                    }
                }
            }
        }
        if bits.last() == Some(&true) {
            bits.push(false);
        }

        Ok(pattern(bits))
    }

    /// The textual description this pattern was expanded from.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The expanded sequence; `true` marks an aggressor row.
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Number of rows the pattern spans.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when the expansion holds no rows.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of aggressor rows in the expansion.
    pub fn aggressors(&self) -> u32 {
        self.bits.iter().filter(|&&b| b).count() as u32
    }

    /// Number of victim rows in the expansion.
    pub fn victims(&self) -> usize {
        self.bits.iter().filter(|&&b| !b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> Rng {
        Rng::from_seed(0x6d616c6c6574)
    }

    #[test]
    fn test_n_sided() {
        let p = HammerPattern::expand("va", 4, 0, &mut rng()).unwrap();
        assert_eq!(
            p.bits(),
            [false, true, false, true, false, true, false, true, false]
        );
        assert_eq!(p.len(), 9);
        assert_eq!(p.aggressors(), 4);
        assert_eq!(p.description(), "va");
    }

    #[test]
    fn test_trailing_victim_only_after_aggressor() {
        let p = HammerPattern::expand("av", 2, 0, &mut rng()).unwrap();
        assert_eq!(p.bits(), [true, false, true, false]);
    }

    #[test]
    fn test_random_area() {
        let mut rng = rng();
        for _ in 0..16 {
            let p = HammerPattern::expand("avax", 4, 40, &mut rng).unwrap();
            // two periods of four slots, x runs fill the area exactly
            assert_eq!(p.len() as u64, 40);
            assert_eq!(p.aggressors(), 4);
            assert_eq!(p.bits().last(), Some(&false));
        }
    }

    #[test]
    fn test_rounds_up_to_whole_periods() {
        let p = HammerPattern::expand("vaa", 3, 0, &mut rng()).unwrap();
        // 3 requested, 2 per period: two periods with 4 aggressors
        assert_eq!(p.aggressors(), 4);
        assert_eq!(p.aggressors() % 2, 0);
    }

    #[test]
    fn test_zero_aggressors() {
        let p = HammerPattern::expand("va", 0, 0, &mut rng()).unwrap();
        assert!(p.is_empty());
        assert_eq!(p.aggressors(), 0);
    }

    #[test]
    fn test_errors() {
        let mut r = rng();
        assert_eq!(
            HammerPattern::expand("", 1, 0, &mut r),
            Err(PatternError::Empty)
        );
        assert_eq!(
            HammerPattern::expand("vq", 1, 0, &mut r),
            Err(PatternError::InvalidToken('q'))
        );
        assert_eq!(
            HammerPattern::expand("vvv", 1, 0, &mut r),
            Err(PatternError::NoAggressors)
        );
        assert!(matches!(
            HammerPattern::expand("ax", 8, 3, &mut r),
            Err(PatternError::AreaTooSmall { .. })
        ));
    }

    #[test]
    fn test_deterministic_from_seed() {
        let a = HammerPattern::expand("axva", 6, 64, &mut Rng::from_seed(1)).unwrap();
        let b = HammerPattern::expand("axva", 6, 64, &mut Rng::from_seed(1)).unwrap();
        assert_eq!(a, b);
    }
}
