use std::cmp::min;
use anyhow::bail;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BackoffConfig {
    /// number of events after the first (immediate) firing before firing again
    pub initial_threshold: u32,
    pub max_threshold: u32,
    /// growth factor for the threshold, in eighths (i.e. 16 doubles the threshold on each firing)
    pub factor_eighths: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_threshold: 2,
            max_threshold: 64,
            factor_eighths: 16,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_threshold == 0 {
            bail!("backoff initial threshold must be at least 1");
        }
        if self.max_threshold < self.initial_threshold {
            bail!("backoff max threshold {} is below the initial threshold {}", self.max_threshold, self.initial_threshold);
        }
        if self.factor_eighths < 8 {
            bail!("backoff factor must not shrink the threshold: {}/8", self.factor_eighths);
        }
        Ok(())
    }
}

/// Event-counting exponential backoff: it does not measure time, but the number of times an
///  action *could* have been taken, and allows it at exponentially growing distances.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    counter: u32,
    threshold: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        ExponentialBackoff {
            config,
            counter: 0,
            threshold: config.initial_threshold,
        }
    }

    /// Registers an event and returns whether the action should be taken for it. `reset` starts
    ///  over from the initial threshold, and the action is always taken for it.
    #[must_use]
    pub fn should_fire(&mut self, reset: bool) -> bool {
        if reset {
            self.counter = 0;
            self.threshold = self.config.initial_threshold;
            return true;
        }

        self.counter += 1;
        if self.counter < self.threshold {
            return false;
        }

        self.counter = 0;
        let grown = (self.threshold as u64 * self.config.factor_eighths as u64) >> 3;
        self.threshold = min(grown, self.config.max_threshold as u64) as u32;
        true
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn config(initial_threshold: u32, max_threshold: u32, factor_eighths: u32) -> BackoffConfig {
        BackoffConfig {
            initial_threshold,
            max_threshold,
            factor_eighths,
        }
    }

    #[rstest]
    #[case::below_threshold(0, 2, config(2, 64, 16), false, false, 1, 2)]
    #[case::reaches_threshold(1, 2, config(2, 64, 16), false, true, 0, 4)]
    #[case::grows_by_factor(3, 4, config(2, 64, 12), false, true, 0, 6)]
    #[case::capped(31, 32, config(2, 40, 16), false, true, 0, 40)]
    #[case::stays_capped(39, 40, config(2, 40, 16), false, true, 0, 40)]
    #[case::reset_fires(1, 16, config(2, 64, 16), true, true, 0, 2)]
    #[case::reset_fires_at_threshold(15, 16, config(3, 64, 16), true, true, 0, 3)]
    fn test_should_fire(
        #[case] counter: u32,
        #[case] threshold: u32,
        #[case] config: BackoffConfig,
        #[case] reset: bool,
        #[case] expected_result: bool,
        #[case] expected_counter: u32,
        #[case] expected_threshold: u32,
    ) {
        let mut backoff = ExponentialBackoff {
            config,
            counter,
            threshold,
        };

        assert_eq!(backoff.should_fire(reset), expected_result);
        assert_eq!(backoff.counter, expected_counter);
        assert_eq!(backoff.threshold, expected_threshold);
    }

    #[test]
    fn test_firing_pattern() {
        let mut backoff = ExponentialBackoff::new(config(2, 8, 16));

        let fired = (0..24)
            .map(|i| backoff.should_fire(i == 0))
            .enumerate()
            .filter(|(_, fired)| *fired)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();

        assert_eq!(fired, vec![0, 2, 6, 14, 22]);
    }

    #[rstest]
    #[case::default(BackoffConfig::default(), true)]
    #[case::zero_initial(config(0, 10, 16), false)]
    #[case::max_below_initial(config(5, 4, 16), false)]
    #[case::constant(config(3, 3, 8), true)]
    #[case::shrinking(config(3, 10, 7), false)]
    fn test_validate(#[case] config: BackoffConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }
}
