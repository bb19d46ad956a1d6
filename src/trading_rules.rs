use crate::config::FillCosts;
use crate::models::Position;

pub const PRICE_EPSILON: f64 = 1e-6;

/// Cash outflow for a buy of `quantity` shares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuyFill {
    pub quantity: i64,
    pub execution_price: f64,
    pub cost: f64,
    pub commission: f64,
    pub total_cost: f64,
}

/// Cash inflow for a sell of `quantity` shares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellFill {
    pub quantity: i64,
    pub execution_price: f64,
    pub gross_proceeds: f64,
    pub commission: f64,
    pub net_proceeds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(BuyFill),
    TooSmall,
    InsufficientCash { required: f64 },
}

/// P&L of a closed round trip. `commission` is entry plus exit commission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedTradePnl {
    pub pnl: f64,
    pub pnl_percent: f64,
    pub commission: f64,
}

pub fn buy_execution_price(price: f64, costs: &FillCosts) -> f64 {
    price * (1.0 + costs.slippage_rate)
}

pub fn sell_execution_price(price: f64, costs: &FillCosts) -> f64 {
    price * (1.0 - costs.slippage_rate)
}

pub fn buy_fill(price: f64, quantity: i64, costs: &FillCosts) -> BuyFill {
    let execution_price = buy_execution_price(price, costs);
    let cost = quantity as f64 * execution_price;
    let commission = cost * costs.commission_rate;
    BuyFill {
        quantity,
        execution_price,
        cost,
        commission,
        total_cost: cost + commission,
    }
}

pub fn sell_fill(price: f64, quantity: i64, costs: &FillCosts) -> SellFill {
    let execution_price = sell_execution_price(price, costs);
    let gross_proceeds = quantity as f64 * execution_price;
    let commission = gross_proceeds * costs.commission_rate;
    SellFill {
        quantity,
        execution_price,
        gross_proceeds,
        commission,
        net_proceeds: gross_proceeds - commission,
    }
}

/// Whole shares affordable for `target_value` at the slipped buy price.
///
/// When the commission pushes the total over `available_cash`, the quantity is
/// reduced to what the cash covers including commission.
pub fn size_for_notional(
    price: f64,
    target_value: f64,
    available_cash: f64,
    costs: &FillCosts,
) -> PositionSizingOutcome {
    if price <= 0.0 || !price.is_finite() || !target_value.is_finite() {
        return PositionSizingOutcome::TooSmall;
    }

    let execution_price = buy_execution_price(price, costs);
    let target = target_value.min(available_cash).max(0.0);
    let quantity = (target / execution_price).floor() as i64;
    if quantity <= 0 {
        if available_cash + PRICE_EPSILON < execution_price {
            return PositionSizingOutcome::InsufficientCash {
                required: execution_price * (1.0 + costs.commission_rate),
            };
        }
        return PositionSizingOutcome::TooSmall;
    }

    let mut fill = buy_fill(price, quantity, costs);
    if fill.total_cost > available_cash + PRICE_EPSILON {
        let affordable =
            (available_cash / (execution_price * (1.0 + costs.commission_rate))).floor() as i64;
        if affordable <= 0 {
            return PositionSizingOutcome::InsufficientCash {
                required: fill.total_cost,
            };
        }
        fill = buy_fill(price, affordable, costs);
    }

    PositionSizingOutcome::Sized(fill)
}

/// Realized P&L of closing `position` with `exit`. The entry commission is
/// already part of `entry_value`, so it is counted exactly once.
pub fn closed_trade_pnl(position: &Position, exit: &SellFill) -> ClosedTradePnl {
    let entry_commission = position.entry_value - position.quantity as f64 * position.entry_price;
    let pnl = exit.net_proceeds - position.entry_value;
    let pnl_percent = if position.entry_value > 0.0 {
        pnl / position.entry_value
    } else {
        0.0
    };
    ClosedTradePnl {
        pnl,
        pnl_percent,
        commission: entry_commission + exit.commission,
    }
}

/// Average cost after adding `add_qty` shares at `add_price`.
pub fn weighted_average_price(old_qty: i64, old_avg: f64, add_qty: i64, add_price: f64) -> f64 {
    let new_qty = old_qty + add_qty;
    if new_qty <= 0 {
        return add_price;
    }
    (old_qty as f64 * old_avg + add_qty as f64 * add_price) / new_qty as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn position_from(fill: &BuyFill) -> Position {
        Position {
            instrument_id: 1,
            symbol: "T".to_string(),
            quantity: fill.quantity,
            entry_price: fill.execution_price,
            entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            entry_value: fill.total_cost,
        }
    }

    #[test]
    fn test_buy_and_sell_apply_slippage_in_opposite_directions() {
        let costs = FillCosts::new(0.001, 0.01);
        let buy = buy_fill(100.0, 10, &costs);
        assert!((buy.execution_price - 101.0).abs() < 1e-9);
        assert!((buy.cost - 1010.0).abs() < 1e-9);
        assert!((buy.commission - 1.01).abs() < 1e-9);
        assert!((buy.total_cost - 1011.01).abs() < 1e-9);

        let sell = sell_fill(100.0, 10, &costs);
        assert!((sell.execution_price - 99.0).abs() < 1e-9);
        assert!((sell.net_proceeds - (990.0 - 0.99)).abs() < 1e-9);
    }

    #[test]
    fn test_sizing_floors_to_whole_shares() {
        let outcome = size_for_notional(10.0, 10_000.0, 100_000.0, &FillCosts::default());
        match outcome {
            PositionSizingOutcome::Sized(fill) => {
                assert_eq!(fill.quantity, 1000);
                assert!((fill.total_cost - 10_000.0).abs() < 1e-9);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_sizing_too_small_and_insufficient_cash() {
        let costs = FillCosts::default();
        assert_eq!(
            size_for_notional(50.0, 20.0, 1_000.0, &costs),
            PositionSizingOutcome::TooSmall
        );
        assert!(matches!(
            size_for_notional(50.0, 1_000.0, 20.0, &costs),
            PositionSizingOutcome::InsufficientCash { .. }
        ));
    }

    #[test]
    fn test_sizing_leaves_room_for_commission() {
        let costs = FillCosts::new(0.01, 0.0);
        match size_for_notional(10.0, 1_000.0, 1_000.0, &costs) {
            PositionSizingOutcome::Sized(fill) => {
                assert_eq!(fill.quantity, 99);
                assert!(fill.total_cost <= 1_000.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_closed_trade_counts_both_commissions() {
        let costs = FillCosts::new(0.001, 0.002);
        let buy = buy_fill(20.0, 100, &costs);
        let position = position_from(&buy);
        let sell = sell_fill(22.0, 100, &costs);
        let result = closed_trade_pnl(&position, &sell);

        assert!((result.commission - (buy.commission + sell.commission)).abs() < 1e-9);
        let expected = sell.gross_proceeds - buy.cost - result.commission;
        assert!((result.pnl - expected).abs() < 1e-9);
        assert!((result.pnl_percent - result.pnl / buy.total_cost).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_average_price() {
        let avg = weighted_average_price(100, 10.0, 50, 13.0);
        assert!((avg - 11.0).abs() < 1e-9);
        assert!((weighted_average_price(0, 0.0, 10, 7.5) - 7.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn round_trip_with_costs_always_loses(
            price in 0.5f64..500.0,
            quantity in 1i64..10_000,
            commission in 0.0001f64..0.01,
            slippage in 0.0001f64..0.01,
        ) {
            let costs = FillCosts::new(commission, slippage);
            let buy = buy_fill(price, quantity, &costs);
            let sell = sell_fill(price, quantity, &costs);
            let result = closed_trade_pnl(&position_from(&buy), &sell);
            prop_assert!(result.pnl < 0.0);
        }

        #[test]
        fn frictionless_round_trip_is_flat(price in 0.5f64..500.0, quantity in 1i64..10_000) {
            let costs = FillCosts::default();
            let buy = buy_fill(price, quantity, &costs);
            let sell = sell_fill(price, quantity, &costs);
            let result = closed_trade_pnl(&position_from(&buy), &sell);
            prop_assert!(result.pnl == 0.0);
            prop_assert!(result.commission == 0.0);
        }
    }
}
