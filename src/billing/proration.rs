use rust_decimal::{Decimal, RoundingStrategy};

use super::error::BillingError;

/// Splits `total` into `participants` shares that add back up to `total` exactly.
///
/// Every share but the last is `total / participants` truncated to cents; the last
/// share absorbs whatever the truncation left over.
pub fn split(total: Decimal, participants: usize) -> Result<Vec<Decimal>, BillingError> {
    if participants == 0 {
        return Err(BillingError::InvalidArgument(
            "participant count must be at least 1".into(),
        ));
    }
    if total.is_sign_negative() && !total.is_zero() {
        return Err(BillingError::InvalidArgument(format!(
            "total must be non-negative, got {total}"
        )));
    }

    let count = Decimal::from(participants as u64);
    let base = (total / count).round_dp_with_strategy(2, RoundingStrategy::ToZero);
    let mut shares = vec![base; participants - 1];
    shares.push(total - base * Decimal::from((participants - 1) as u64));
    Ok(shares)
}

/// Applies a percentage discount, returning `(discount_amount, net_value)` rounded to cents.
pub fn apply_discount(
    value: Decimal,
    discount_percent: Decimal,
) -> Result<(Decimal, Decimal), BillingError> {
    if discount_percent < Decimal::ZERO || discount_percent > Decimal::ONE_HUNDRED {
        return Err(BillingError::InvalidArgument(format!(
            "discount percent must be within 0..=100, got {discount_percent}"
        )));
    }
    let net = (value * (Decimal::ONE - discount_percent / Decimal::ONE_HUNDRED))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    Ok((value - net, net))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn even_split_has_identical_shares() {
        let shares = split(dec!(300.00), 3).unwrap();
        assert_eq!(shares, vec![dec!(100.00), dec!(100.00), dec!(100.00)]);
    }

    #[test]
    fn remainder_lands_on_last_participant() {
        let shares = split(dec!(100.00), 3).unwrap();
        assert_eq!(shares, vec![dec!(33.33), dec!(33.33), dec!(33.34)]);
    }

    #[test]
    fn shares_always_sum_to_total() {
        let totals = [
            dec!(0),
            dec!(0.01),
            dec!(0.05),
            dec!(1.00),
            dec!(99.99),
            dec!(149.90),
            dec!(1234.57),
        ];
        for total in totals {
            for participants in 1..=12 {
                let shares = split(total, participants).unwrap();
                assert_eq!(shares.len(), participants);
                assert_eq!(shares.iter().copied().sum::<Decimal>(), total);
                assert!(shares.iter().all(|share| *share >= Decimal::ZERO));
            }
        }
    }

    #[test]
    fn single_participant_takes_everything() {
        assert_eq!(split(dec!(89.90), 1).unwrap(), vec![dec!(89.90)]);
    }

    #[test]
    fn zero_participants_is_rejected() {
        let err = split(dec!(10), 0).unwrap_err();
        assert!(matches!(err, BillingError::InvalidArgument(_)));
    }

    #[test]
    fn negative_total_is_rejected() {
        let err = split(dec!(-1.00), 2).unwrap_err();
        assert!(matches!(err, BillingError::InvalidArgument(_)));
    }

    #[test]
    fn discount_splits_gross_into_discount_and_net() {
        let (discount, net) = apply_discount(dec!(150.00), dec!(10)).unwrap();
        assert_eq!(discount, dec!(15.00));
        assert_eq!(net, dec!(135.00));

        let (discount, net) = apply_discount(dec!(99.99), dec!(0)).unwrap();
        assert_eq!(discount, dec!(0.00));
        assert_eq!(net, dec!(99.99));
    }

    #[test]
    fn discount_out_of_range_is_rejected() {
        assert!(apply_discount(dec!(10), dec!(101)).is_err());
    }
}
