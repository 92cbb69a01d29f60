//! Body composition estimates from weight and bioelectrical impedance
//!
//! Formulas follow the ones used by the vendor's companion app as
//! reverse-engineered by the community. Values are clamped to plausible ranges.

use crate::domain::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

const MAX_HEIGHT_CM: f64 = 220.0;
const MAX_AGE_YEARS: f64 = 99.0;

const BODY_TYPES: [&str; 9] = [
    "obese",
    "overweight",
    "thick-set",
    "lack-exerscise",
    "balanced",
    "balanced-muscular",
    "skinny",
    "balanced-skinny",
    "skinny-muscular",
];

const FAT_DESCRIPTIONS: [&str; 5] = ["Very Low", "Low", "Normal", "High", "Very High"];
const LEVEL_DESCRIPTIONS: [&str; 3] = ["Insufficient", "Normal", "Good"];
const VISCERAL_FAT_DESCRIPTIONS: [&str; 3] = ["Normal", "High", "Very High"];
const BMI_DESCRIPTIONS: [&str; 5] = [
    "Underweight",
    "Normal",
    "Overweight",
    "Obese",
    "Morbidly Obese",
];

/// (minimum height, female range, male range)
const MUSCLE_MASS_SCALES: [(f64, [f64; 2], [f64; 2]); 3] = [
    (170.0, [36.5, 42.5], [49.5, 59.4]),
    (160.0, [32.9, 37.5], [44.0, 52.4]),
    (0.0, [29.1, 34.7], [38.5, 46.5]),
];

/// (female min weight, female optimum, male min weight, male optimum)
const BONE_MASS_SCALES: [(f64, f64, f64, f64); 3] = [
    (60.0, 2.5, 75.0, 3.2),
    (45.0, 2.2, 69.0, 2.9),
    (0.0, 1.8, 0.0, 2.5),
];

/// (max age, female thresholds, male thresholds)
const FAT_PERCENTAGE_SCALES: [(f64, [f64; 4], [f64; 4]); 9] = [
    (20.0, [18.0, 23.0, 30.0, 35.0], [8.0, 14.0, 21.0, 25.0]),
    (25.0, [19.0, 24.0, 30.0, 35.0], [10.0, 15.0, 22.0, 26.0]),
    (30.0, [20.0, 25.0, 31.0, 36.0], [11.0, 16.0, 21.0, 27.0]),
    (35.0, [21.0, 26.0, 33.0, 36.0], [13.0, 17.0, 25.0, 28.0]),
    (40.0, [22.0, 27.0, 34.0, 37.0], [15.0, 20.0, 26.0, 29.0]),
    (45.0, [23.0, 28.0, 35.0, 38.0], [16.0, 22.0, 27.0, 30.0]),
    (50.0, [24.0, 30.0, 36.0, 38.0], [17.0, 23.0, 29.0, 31.0]),
    (55.0, [26.0, 31.0, 36.0, 39.0], [19.0, 25.0, 30.0, 33.0]),
    (100.0, [27.0, 32.0, 37.0, 40.0], [21.0, 26.0, 31.0, 34.0]),
];

/// (age below, female coefficient, male coefficient)
const BMR_COEFFICIENTS: [(f64, f64, f64); 6] = [
    (12.0, 34.0, 36.0),
    (15.0, 29.0, 30.0),
    (17.0, 24.0, 26.0),
    (29.0, 22.0, 23.0),
    (50.0, 20.0, 21.0),
    (120.0, 19.0, 20.0),
];

const WATER_PERCENTAGE_SCALE: [f64; 2] = [53.0, 67.0];
const VISCERAL_FAT_SCALE: [f64; 2] = [10.0, 15.0];
const BMI_SCALE: [f64; 4] = [18.5, 25.0, 28.0, 32.0];

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// First description whose threshold is not exceeded, else the last one
fn describe(value: f64, scale: &[f64], descriptions: &[&'static str]) -> &'static str {
    scale
        .iter()
        .position(|threshold| value <= *threshold)
        .and_then(|i| descriptions.get(i))
        .or_else(|| descriptions.last())
        .copied()
        .unwrap_or("")
}

/// Everything published next to the weight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BodyComposition {
    pub lbm: f64,
    pub bmi: f64,
    pub fat_pct: f64,
    pub water_pct: f64,
    pub bone_mass_kg: f64,
    pub muscle_mass_kg: f64,
    pub visceral_fat_mass_kg: f64,
    pub bmr_kcal: f64,
    /// Daily energy need for the profile's age band
    pub bmr_scale_kcal: Option<f64>,
    pub ideal_weight_kg: f64,
    pub fat: &'static str,
    pub water: &'static str,
    pub bone_mass: &'static str,
    pub muscle_mass: &'static str,
    pub visceral_fat: &'static str,
    pub bmi_class: &'static str,
    pub body_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyMetrics {
    height: f64,
    age: f64,
    sex: Sex,
}

impl BodyMetrics {
    /// `height` in cm, `age` in years
    pub fn new(height: f64, age: f64, sex: Sex) -> Result<Self> {
        if !height.is_finite() || height > MAX_HEIGHT_CM {
            return Err(BridgeError::InvalidConfig(format!(
                "height must be at most {} cm, got {}",
                MAX_HEIGHT_CM, height
            )));
        }
        if !age.is_finite() || age > MAX_AGE_YEARS {
            return Err(BridgeError::InvalidConfig(format!(
                "age must be at most {} years, got {:.1}",
                MAX_AGE_YEARS, age
            )));
        }
        Ok(Self { height, age, sex })
    }

    pub fn lbm_coefficient(&self, weight: f64, impedance: f64) -> f64 {
        let mut lbm = (self.height * 9.058 / 100.0) * (self.height / 100.0);
        lbm += weight * 0.32 + 12.226;
        lbm -= impedance * 0.0068;
        lbm -= self.age * 0.0542;
        lbm
    }

    pub fn bmr(&self, weight: f64) -> f64 {
        let bmr = match self.sex {
            Sex::Male => {
                let bmr = 877.8 + weight * 14.916 - self.height * 0.726 - self.age * 8.976;
                if bmr > 2322.0 {
                    5000.0
                } else {
                    bmr
                }
            }
            Sex::Female => {
                let bmr = 864.6 + weight * 10.2036 - self.height * 0.39336 - self.age * 6.204;
                if bmr > 2996.0 {
                    5000.0
                } else {
                    bmr
                }
            }
        };
        clamp(bmr, 500.0, 10000.0)
    }

    pub fn bmr_scale(&self, weight: f64) -> Option<f64> {
        BMR_COEFFICIENTS
            .iter()
            .find(|(below, _, _)| *below > self.age)
            .map(|(_, female, male)| match self.sex {
                Sex::Male => weight * male,
                Sex::Female => weight * female,
            })
    }

    pub fn fat_percentage(&self, weight: f64, impedance: f64) -> f64 {
        let lbm = self.lbm_coefficient(weight, impedance);

        let negative_constant = match self.sex {
            Sex::Female if self.age <= 49.0 => 9.25,
            Sex::Female => 7.25,
            Sex::Male => 0.8,
        };

        let tall = if self.height > 160.0 { 1.03 } else { 1.0 };
        let coefficient = match self.sex {
            Sex::Male if weight < 61.0 => 0.98,
            Sex::Female if weight > 60.0 => 0.96 * tall,
            Sex::Female if weight < 50.0 => 1.02 * tall,
            _ => 1.0,
        };

        let mut fat = (1.0 - ((lbm - negative_constant) * coefficient) / weight) * 100.0;
        if fat > 63.0 {
            fat = 75.0;
        }
        clamp(fat, 5.0, 75.0)
    }

    /// Four thresholds between very low, low, normal, high and very high
    pub fn fat_percentage_scale(&self) -> [f64; 4] {
        let years = self.age.floor();
        let (_, female, male) = FAT_PERCENTAGE_SCALES
            .iter()
            .find(|(max_age, _, _)| years <= *max_age)
            .copied()
            .unwrap_or(FAT_PERCENTAGE_SCALES[FAT_PERCENTAGE_SCALES.len() - 1]);
        match self.sex {
            Sex::Male => male,
            Sex::Female => female,
        }
    }

    pub fn water_percentage(&self, weight: f64, impedance: f64) -> f64 {
        let mut water = (100.0 - self.fat_percentage(weight, impedance)) * 0.7;
        let coefficient = if water <= 50.0 { 1.02 } else { 0.98 };
        if water * coefficient >= 65.0 {
            water = 75.0;
        }
        clamp(water * coefficient, 35.0, 75.0)
    }

    pub fn bone_mass(&self, weight: f64, impedance: f64) -> f64 {
        let base = match self.sex {
            Sex::Female => 0.245691014,
            Sex::Male => 0.18016894,
        };
        let mut bone = (base - self.lbm_coefficient(weight, impedance) * 0.05158) * -1.0;
        if bone > 2.2 {
            bone += 0.1;
        } else {
            bone -= 0.1;
        }

        let overflow = match self.sex {
            Sex::Female => 5.1,
            Sex::Male => 5.2,
        };
        if bone > overflow {
            bone = 8.0;
        }
        clamp(bone, 0.5, 8.0)
    }

    pub fn bone_mass_scale(&self, weight: f64) -> [f64; 2] {
        let optimal = BONE_MASS_SCALES
            .iter()
            .find_map(|(f_min, f_opt, m_min, m_opt)| match self.sex {
                Sex::Female if weight >= *f_min => Some(*f_opt),
                Sex::Male if weight >= *m_min => Some(*m_opt),
                _ => None,
            })
            .unwrap_or(0.0);
        [optimal - 1.0, optimal + 1.0]
    }

    pub fn muscle_mass(&self, weight: f64, impedance: f64) -> f64 {
        let mut muscle = weight
            - (self.fat_percentage(weight, impedance) * 0.01) * weight
            - self.bone_mass(weight, impedance);

        let overflow = match self.sex {
            Sex::Female => 84.0,
            Sex::Male => 93.5,
        };
        if muscle >= overflow {
            muscle = 120.0;
        }
        clamp(muscle, 10.0, 120.0)
    }

    pub fn muscle_mass_scale(&self) -> [f64; 2] {
        let (_, female, male) = MUSCLE_MASS_SCALES
            .iter()
            .find(|(min_height, _, _)| self.height >= *min_height)
            .copied()
            .unwrap_or(MUSCLE_MASS_SCALES[MUSCLE_MASS_SCALES.len() - 1]);
        match self.sex {
            Sex::Male => male,
            Sex::Female => female,
        }
    }

    pub fn visceral_fat(&self, weight: f64) -> f64 {
        let h = self.height;
        let vfal = match self.sex {
            Sex::Female => {
                if weight > (13.0 - h * 0.5) * -1.0 {
                    let subsubcalc = (h * 1.45 + (h * 0.1158) * h) - 120.0;
                    let subcalc = weight * 500.0 / subsubcalc;
                    (subcalc - 6.0) + self.age * 0.07
                } else {
                    let subcalc = 0.691 + h * -0.0024 + h * -0.0024;
                    ((h * 0.027 - subcalc * weight) * -1.0) + self.age * 0.07 - self.age
                }
            }
            Sex::Male => {
                if h < weight * 1.6 {
                    let subcalc = ((h * 0.4) - (h * (h * 0.0826))) * -1.0;
                    (weight * 305.0) / (subcalc + 48.0) - 2.9 + self.age * 0.15
                } else {
                    let subcalc = 0.765 + h * -0.0015;
                    ((h * 0.143 - weight * subcalc) * -1.0) + self.age * 0.15 - 5.0
                }
            }
        };
        clamp(vfal, 1.0, 50.0)
    }

    pub fn bmi(&self, weight: f64) -> f64 {
        let meters = self.height / 100.0;
        clamp(weight / (meters * meters), 10.0, 90.0)
    }

    /// Reverse BMI of 22
    pub fn ideal_weight(&self) -> f64 {
        clamp(22.0 * self.height * self.height / 10000.0, 5.5, 198.0)
    }

    pub fn body_type(&self, weight: f64, impedance: f64) -> &'static str {
        let fat = self.fat_percentage(weight, impedance);
        let muscle = self.muscle_mass(weight, impedance);
        let fat_scale = self.fat_percentage_scale();
        let muscle_scale = self.muscle_mass_scale();

        let factor = if fat > fat_scale[2] {
            0
        } else if fat < fat_scale[1] {
            2
        } else {
            1
        };

        let index = if muscle > muscle_scale[1] {
            2 + factor * 3
        } else if muscle < muscle_scale[0] {
            factor * 3
        } else {
            1 + factor * 3
        };
        BODY_TYPES[index]
    }

    pub fn composition(&self, weight: f64, impedance: f64) -> BodyComposition {
        let fat_pct = round2(self.fat_percentage(weight, impedance));
        let water_pct = round2(self.water_percentage(weight, impedance));
        let bone_mass_kg = round2(self.bone_mass(weight, impedance));
        let muscle_mass_kg = round2(self.muscle_mass(weight, impedance));
        let visceral_fat_mass_kg = round2(self.visceral_fat(weight));
        let bmi = round2(self.bmi(weight));

        BodyComposition {
            lbm: round2(self.lbm_coefficient(weight, impedance)),
            bmi,
            fat_pct,
            water_pct,
            bone_mass_kg,
            muscle_mass_kg,
            visceral_fat_mass_kg,
            bmr_kcal: round2(self.bmr(weight)),
            bmr_scale_kcal: self.bmr_scale(weight).map(round2),
            ideal_weight_kg: round2(self.ideal_weight()),
            fat: describe(fat_pct, &self.fat_percentage_scale(), &FAT_DESCRIPTIONS),
            water: describe(water_pct, &WATER_PERCENTAGE_SCALE, &LEVEL_DESCRIPTIONS),
            bone_mass: describe(
                bone_mass_kg,
                &self.bone_mass_scale(weight),
                &LEVEL_DESCRIPTIONS,
            ),
            muscle_mass: describe(
                muscle_mass_kg,
                &self.muscle_mass_scale(),
                &LEVEL_DESCRIPTIONS,
            ),
            visceral_fat: describe(
                visceral_fat_mass_kg,
                &VISCERAL_FAT_SCALE,
                &VISCERAL_FAT_DESCRIPTIONS,
            ),
            bmi_class: describe(bmi, &BMI_SCALE, &BMI_DESCRIPTIONS),
            body_type: self.body_type(weight, impedance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn male() -> BodyMetrics {
        BodyMetrics::new(180.0, 30.0, Sex::Male).unwrap()
    }

    #[test]
    fn test_limits_are_validated() {
        assert!(BodyMetrics::new(221.0, 30.0, Sex::Male).is_err());
        assert!(BodyMetrics::new(170.0, 100.0, Sex::Female).is_err());
        assert!(BodyMetrics::new(f64::NAN, 30.0, Sex::Female).is_err());
    }

    #[test]
    fn test_bmi_and_ideal_weight() {
        let metrics = male();
        assert!((metrics.bmi(81.0) - 25.0).abs() < 1e-9);
        assert!((metrics.ideal_weight() - 71.28).abs() < 1e-9);
        assert_eq!(describe(25.0, &BMI_SCALE, &BMI_DESCRIPTIONS), "Normal");
        assert_eq!(describe(40.0, &BMI_SCALE, &BMI_DESCRIPTIONS), "Morbidly Obese");
    }

    #[test]
    fn test_values_stay_within_bounds() {
        let metrics = male();
        for (weight, impedance) in [(40.0, 300.0), (80.0, 500.0), (150.0, 800.0)] {
            let fat = metrics.fat_percentage(weight, impedance);
            assert!((5.0..=75.0).contains(&fat));
            let water = metrics.water_percentage(weight, impedance);
            assert!((35.0..=75.0).contains(&water));
            let bone = metrics.bone_mass(weight, impedance);
            assert!((0.5..=8.0).contains(&bone));
            let muscle = metrics.muscle_mass(weight, impedance);
            assert!((10.0..=120.0).contains(&muscle));
        }
    }

    #[test]
    fn test_scales_depend_on_profile() {
        assert_eq!(male().fat_percentage_scale(), [11.0, 16.0, 21.0, 27.0]);
        let older = BodyMetrics::new(165.0, 38.5, Sex::Female).unwrap();
        assert_eq!(older.fat_percentage_scale(), [22.0, 27.0, 34.0, 37.0]);
        assert_eq!(older.muscle_mass_scale(), [32.9, 37.5]);
        let bone = male().bone_mass_scale(70.0);
        assert!((bone[0] - 1.9).abs() < 1e-9 && (bone[1] - 3.9).abs() < 1e-9);
        assert_eq!(male().bmr_scale(80.0), Some(80.0 * 21.0));
    }

    #[test]
    fn test_composition_is_rounded() {
        let composition = male().composition(75.0, 480.0);
        assert_eq!(composition.lbm, round2(composition.lbm));
        assert!(BODY_TYPES.contains(&composition.body_type));
        assert_eq!(composition.bmi, 23.15);
        assert_eq!(composition.bmr_scale_kcal, Some(1575.0));
        assert_eq!(composition.ideal_weight_kg, 71.28);
    }
}
