/// Empirical lux constant for the fitted photocell curve.
const LUX_K: f32 = 128_383.0;
const LUX_EXPONENT: f32 = 1.137;

/// Photocell on a voltage divider against a fixed resistor. The ADC reads
/// the divider midpoint; resistance falls as light rises.
#[derive(Debug, Clone)]
pub struct Photocell {
    pub fixed_resistor_ohms: f32,
    pub supply_voltage: f32,
}

impl Default for Photocell {
    fn default() -> Self {
        Self {
            fixed_resistor_ohms: 10_000.0,
            supply_voltage: 3.3,
        }
    }
}

impl Photocell {
    pub fn new(fixed_resistor_ohms: f32, supply_voltage: f32) -> Self {
        Self {
            fixed_resistor_ohms,
            supply_voltage,
        }
    }

    /// LDR resistance from a 16-bit ADC sample.
    pub fn resistance_from_adc(&self, adc_value: u16) -> f32 {
        if adc_value == 0 {
            return f32::INFINITY;
        }
        let voltage = f32::from(adc_value) * self.supply_voltage / 65_535.0;
        if voltage >= self.supply_voltage {
            return 0.0;
        }
        self.fixed_resistor_ohms * (self.supply_voltage / voltage - 1.0)
    }

    pub fn lux_from_resistance(&self, r_ldr: f32) -> f32 {
        if r_ldr == 0.0 {
            // Divider railed: saturated bright.
            return 10_000.0;
        }
        (LUX_K / r_ldr).powf(LUX_EXPONENT).max(0.0)
    }

    pub fn lux_from_adc(&self, adc_value: u16) -> u32 {
        self.lux_from_resistance(self.resistance_from_adc(adc_value))
            .round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dark_reading_is_zero_lux() {
        let sensor = Photocell::default();
        assert!(sensor.resistance_from_adc(0).is_infinite());
        assert_eq!(sensor.lux_from_adc(0), 0);
    }

    #[test]
    fn railed_reading_saturates() {
        let sensor = Photocell::default();
        assert_eq!(sensor.resistance_from_adc(u16::MAX), 0.0);
        assert_eq!(sensor.lux_from_adc(u16::MAX), 10_000);
    }

    #[test]
    fn midpoint_reads_the_fixed_resistor() {
        // At half the supply the LDR equals the fixed resistor.
        let sensor = Photocell::default();
        let r = sensor.resistance_from_adc(u16::MAX / 2);
        assert!((r - sensor.fixed_resistor_ohms).abs() < 5.0);
    }

    #[test]
    fn lux_rises_with_adc_value() {
        let sensor = Photocell::new(10_000.0, 5.0);
        let dim = sensor.lux_from_adc(8_000);
        let bright = sensor.lux_from_adc(48_000);
        assert!(bright > dim);
    }
}
