//! Quality gates applied to observations before they are written. The
//! condition rule is carried by the `Condition` type itself.

use thiserror::Error;

use crate::catalog::PriceObservation;

pub const MAX_PRICE: f64 = 100_000.0;
pub const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no price")]
    MissingPrice,
    #[error("price {0} outside (0, 100000)")]
    PriceOutOfRange(f64),
    #[error("card name is empty")]
    EmptyName,
    #[error("card name longer than 200 chars")]
    NameTooLong,
}

/// Every rule the row breaks; empty means it passes.
pub fn validate(obs: &PriceObservation, card_name: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    match obs.price_usd.or(obs.price_eur) {
        None => errors.push(ValidationError::MissingPrice),
        Some(p) if !(p > 0.0 && p < MAX_PRICE) => {
            errors.push(ValidationError::PriceOutOfRange(p))
        }
        Some(_) => {}
    }
    let name = card_name.trim();
    if name.is_empty() {
        errors.push(ValidationError::EmptyName);
    } else if name.chars().count() > MAX_NAME_LEN {
        errors.push(ValidationError::NameTooLong);
    }
    errors
}

/// Flags values far from a card's recent prices. Flagged rows are still
/// written; the count is reported.
#[derive(Debug, Clone, Copy)]
pub struct OutlierDetector {
    pub k: f64,
    pub ratio: f64,
    pub min_samples: usize,
}

impl Default for OutlierDetector {
    fn default() -> Self {
        Self {
            k: 3.0,
            ratio: 10.0,
            min_samples: 3,
        }
    }
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

impl OutlierDetector {
    pub fn is_outlier(&self, value: f64, baseline: &[f64]) -> bool {
        if baseline.len() < self.min_samples {
            return false;
        }
        let n = baseline.len() as f64;
        let mean = baseline.iter().sum::<f64>() / n;
        let var = baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let sd = var.sqrt();
        if sd > 0.0 && (value - mean).abs() > self.k * sd {
            return true;
        }
        let mut sorted = baseline.to_vec();
        sorted.sort_by(f64::total_cmp);
        let med = median(&sorted);
        med > 0.0 && (value > med * self.ratio || value < med / self.ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Condition;
    use chrono::Utc;

    fn obs(price: Option<f64>) -> PriceObservation {
        PriceObservation {
            printing_id: "p1".into(),
            source_id: 1,
            condition: Condition::NearMint,
            price_usd: price,
            price_eur: None,
            stock_quantity: None,
            is_foil: false,
            observed_at: Utc::now(),
            url: None,
            variant: None,
        }
    }

    #[test]
    fn range_and_name_rules() {
        assert!(validate(&obs(Some(1.5)), "Lightning Bolt").is_empty());
        assert_eq!(
            validate(&obs(Some(0.0)), "Bolt"),
            vec![ValidationError::PriceOutOfRange(0.0)]
        );
        assert_eq!(
            validate(&obs(Some(250_000.0)), ""),
            vec![
                ValidationError::PriceOutOfRange(250_000.0),
                ValidationError::EmptyName
            ]
        );
        assert_eq!(validate(&obs(None), "Bolt"), vec![ValidationError::MissingPrice]);
        assert_eq!(
            validate(&obs(Some(2.0)), &"x".repeat(201)),
            vec![ValidationError::NameTooLong]
        );
    }

    #[test]
    fn outliers_need_a_baseline() {
        let d = OutlierDetector::default();
        assert!(!d.is_outlier(500.0, &[1.0, 1.1]));
        assert!(d.is_outlier(50.0, &[4.0, 5.0, 6.0]));
        assert!(d.is_outlier(0.3, &[4.0, 5.0, 6.0]));
        assert!(!d.is_outlier(5.5, &[4.0, 5.0, 6.0]));
        // flat history: only the ratio rule applies
        assert!(!d.is_outlier(12.0, &[10.0, 10.0, 10.0]));
        assert!(d.is_outlier(101.0, &[10.0, 10.0, 10.0]));
    }
}
