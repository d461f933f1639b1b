// clockfeed: PID controller
//
// output = kp*e + ki*integral(e dt) + kd*de/dt. Integral term saturates at
// +/- freq_adjust_max. kd is 0 by default. Reset zeroes all accumulators.

/// PID gains, `kp`/`ki` sourced from the `pid_filter_p`/`pid_filter_i`
/// config options (both in `[0,1]`); `kd` defaults to zero.
#[derive(Debug, Clone, Copy)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
        }
    }
}

/// A PID controller whose integral term saturates at the driver's
/// reported frequency-adjustment cap.
pub struct Pid {
    config: PidConfig,
    integral: f64,
    prev_error: Option<f64>,
    output_limit: f64,
}

impl Pid {
    pub fn new(config: PidConfig, output_limit: f64) -> Self {
        Self {
            config,
            integral: 0.0,
            prev_error: None,
            output_limit: output_limit.abs(),
        }
    }

    /// Reset zeroes all accumulators; does not change gains.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }

    pub fn set_gains(&mut self, config: PidConfig) {
        self.config = config;
    }

    pub fn set_output_limit(&mut self, limit: f64) {
        self.output_limit = limit.abs();
    }

    /// Advance the controller by one sample of error `e` taken `dt`
    /// seconds after the previous sample (or the first sample, in which
    /// case the derivative term is zero). Returns the saturated output.
    pub fn update(&mut self, error: f64, dt_secs: f64) -> f64 {
        self.integral += error * dt_secs;
        self.integral = self
            .integral
            .clamp(-self.output_limit, self.output_limit);

        let derivative = match self.prev_error {
            Some(prev) if dt_secs > 0.0 => (error - prev) / dt_secs,
            _ => 0.0,
        };
        self.prev_error = Some(error);

        let output =
            self.config.kp * error + self.config.ki * self.integral + self.config.kd * derivative;
        output.clamp(-self.output_limit, self.output_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_only_tracks_error() {
        let mut pid = Pid::new(
            PidConfig {
                kp: 2.0,
                ki: 0.0,
                kd: 0.0,
            },
            1000.0,
        );
        assert_eq!(pid.update(3.0, 1.0), 6.0);
    }

    #[test]
    fn integral_accumulates_and_saturates() {
        let mut pid = Pid::new(
            PidConfig {
                kp: 0.0,
                ki: 1.0,
                kd: 0.0,
            },
            5.0,
        );
        assert_eq!(pid.update(10.0, 1.0), 5.0); // saturated immediately
        assert_eq!(pid.update(10.0, 1.0), 5.0); // stays saturated
    }

    #[test]
    fn reset_zeroes_accumulators() {
        let mut pid = Pid::new(
            PidConfig {
                kp: 0.0,
                ki: 1.0,
                kd: 0.0,
            },
            100.0,
        );
        pid.update(10.0, 1.0);
        pid.reset();
        // immediately after reset, integral contribution for one small
        // step should equal exactly that step, not an accumulation of the
        // prior call.
        assert_eq!(pid.update(1.0, 1.0), 1.0);
    }

    #[test]
    fn output_never_exceeds_limit() {
        let mut pid = Pid::new(
            PidConfig {
                kp: 1000.0,
                ki: 1000.0,
                kd: 1000.0,
            },
            50.0,
        );
        for _ in 0..10 {
            let out = pid.update(1.0, 1.0);
            assert!(out.abs() <= 50.0 + f64::EPSILON);
        }
    }
}
