use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::listing::{DollarAmount, Percentage};
use crate::rentometer::{EstimateCollection, EstimateKind};

pub const DEFAULT_MORTGAGE_YEARS: u32 = 30;

/// Monthly mortgage payment: M = p * r(1 + r)^n / ((1 + r)^n - 1), where p
/// is the principal, r the monthly rate and n the number of payments.
pub fn monthly_mortgage_payment(
    price: DollarAmount,
    yearly_rate: Percentage,
    down_payment: DollarAmount,
    mortgage_years: u32,
) -> DollarAmount {
    let principal = price - down_payment;
    let n = f64::from(mortgage_years * 12);
    let r = yearly_rate / 100.0 / 12.0;

    if r == 0.0 {
        return principal / n;
    }
    principal * (r * (1.0 + r).powf(n)) / ((1.0 + r).powf(n) - 1.0)
}

pub fn down_payment(price: DollarAmount, percent_down: Percentage) -> DollarAmount {
    price * (percent_down / 100.0)
}

pub fn percent_of(price: DollarAmount, rate: Percentage) -> DollarAmount {
    price * (rate / 100.0)
}

/// Monthly set-aside for a cost expressed as a yearly percentage of the
/// purchase price (capex, maintenance, property taxes).
pub fn monthly_reserve(price: DollarAmount, yearly_rate: Percentage) -> DollarAmount {
    price * (yearly_rate / 100.0) / 12.0
}

/// Candidate values for every scenario knob. The writer expands the full
/// cartesian product, one sheet row per combination per estimate kind.
#[derive(Debug, Clone)]
pub struct ScenarioParams {
    // Upfront expenses
    pub down_payment_rates: Vec<Percentage>,
    pub closing_cost_rates: Vec<Percentage>,
    pub immediate_repair_rates: Vec<Percentage>,
    pub furnishing_costs: Vec<DollarAmount>,

    // Ongoing expenses
    pub yearly_mortgage_rates: Vec<Percentage>,
    pub monthly_utility_costs: Vec<DollarAmount>,
    pub yearly_capex_rates: Vec<Percentage>,
    pub yearly_maintenance_rates: Vec<Percentage>,
    pub monthly_management_rates: Vec<Percentage>,

    pub property_tax_rate: Percentage,
    pub mortgage_years: u32,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            down_payment_rates: vec![5.0],
            closing_cost_rates: vec![3.0],
            immediate_repair_rates: vec![3.0],
            furnishing_costs: vec![10_000.0],
            yearly_mortgage_rates: vec![3.23],
            monthly_utility_costs: vec![300.0],
            yearly_capex_rates: vec![1.25],
            yearly_maintenance_rates: vec![0.5],
            monthly_management_rates: vec![10.0],
            property_tax_rate: 0.83,
            mortgage_years: DEFAULT_MORTGAGE_YEARS,
        }
    }
}

/// One computed financial scenario for one estimate kind.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub estimate_kind: EstimateKind,

    pub down_payment_rate: Percentage,
    pub closing_cost_rate: Percentage,
    pub immediate_repair_rate: Percentage,
    pub furnishing_cost: DollarAmount,
    pub mortgage_rate: Percentage,
    pub monthly_utilities: DollarAmount,
    pub yearly_capex_rate: Percentage,
    pub yearly_maintenance_rate: Percentage,
    pub management_rate: Percentage,

    pub down_payment: DollarAmount,
    pub upfront_cost: DollarAmount,
    pub monthly_mortgage: DollarAmount,
    pub monthly_taxes: DollarAmount,
    pub monthly_management_fee: DollarAmount,
    pub total_monthly_expenses: DollarAmount,
    pub gross_monthly_rent: DollarAmount,
    pub monthly_cash_flow: DollarAmount,
    /// None when the scenario never pays itself back.
    pub months_to_recoup: Option<f64>,
}

/// Expand the cartesian product of all knob lists against each estimate
/// group present in the collection.
pub fn expand_scenarios(
    price: DollarAmount,
    params: &ScenarioParams,
    estimates: &EstimateCollection,
) -> Vec<Scenario> {
    let mut scenarios = Vec::new();

    for &dp_rate in &params.down_payment_rates {
        for &cc_rate in &params.closing_cost_rates {
            for &ir_rate in &params.immediate_repair_rates {
                for &furnishing in &params.furnishing_costs {
                    for &m_rate in &params.yearly_mortgage_rates {
                        for &utilities in &params.monthly_utility_costs {
                            for &capex_rate in &params.yearly_capex_rates {
                                for &maint_rate in &params.yearly_maintenance_rates {
                                    for &mgmt_rate in &params.monthly_management_rates {
                                        for group in estimates.groups() {
                                            let gross: DollarAmount = group
                                                .units
                                                .iter()
                                                .map(|u| u.monthly_rent)
                                                .sum();

                                            let dp = down_payment(price, dp_rate);
                                            let upfront = dp
                                                + percent_of(price, cc_rate)
                                                + percent_of(price, ir_rate)
                                                + furnishing;

                                            let mortgage = monthly_mortgage_payment(
                                                price,
                                                m_rate,
                                                dp,
                                                params.mortgage_years,
                                            );
                                            let taxes = monthly_reserve(
                                                price,
                                                params.property_tax_rate,
                                            );
                                            let management =
                                                gross * (mgmt_rate / 100.0);
                                            let expenses = mortgage
                                                + utilities
                                                + monthly_reserve(price, capex_rate)
                                                + monthly_reserve(price, maint_rate)
                                                + taxes
                                                + management;

                                            let cash_flow = gross - expenses;
                                            let months_to_recoup = if cash_flow > 0.0 {
                                                Some(upfront / cash_flow)
                                            } else {
                                                None
                                            };

                                            scenarios.push(Scenario {
                                                estimate_kind: group.kind,
                                                down_payment_rate: dp_rate,
                                                closing_cost_rate: cc_rate,
                                                immediate_repair_rate: ir_rate,
                                                furnishing_cost: furnishing,
                                                mortgage_rate: m_rate,
                                                monthly_utilities: utilities,
                                                yearly_capex_rate: capex_rate,
                                                yearly_maintenance_rate: maint_rate,
                                                management_rate: mgmt_rate,
                                                down_payment: dp,
                                                upfront_cost: upfront,
                                                monthly_mortgage: mortgage,
                                                monthly_taxes: taxes,
                                                monthly_management_fee: management,
                                                total_monthly_expenses: expenses,
                                                gross_monthly_rent: gross,
                                                monthly_cash_flow: cash_flow,
                                                months_to_recoup,
                                            });
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    scenarios
}

/// Export scenarios to a CSV file for manual review.
pub fn export_to_csv(scenarios: &[Scenario], filename: &str) -> Result<()> {
    if let Some(parent) = Path::new(filename).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {:?}", parent))?;
    }
    let file = File::create(filename)
        .with_context(|| format!("Failed to create CSV file: {}", filename))?;

    let mut wtr = csv::Writer::from_writer(file);

    wtr.write_record([
        "estimate",
        "down_payment_rate",
        "closing_cost_rate",
        "immediate_repair_rate",
        "furnishing_cost",
        "mortgage_rate",
        "monthly_utilities",
        "yearly_capex_rate",
        "yearly_maintenance_rate",
        "management_rate",
        "down_payment",
        "upfront_cost",
        "monthly_mortgage",
        "monthly_taxes",
        "monthly_management_fee",
        "total_monthly_expenses",
        "gross_monthly_rent",
        "monthly_cash_flow",
        "months_to_recoup",
    ])?;

    for s in scenarios {
        wtr.write_record([
            s.estimate_kind.label().to_string(),
            format!("{}", s.down_payment_rate),
            format!("{}", s.closing_cost_rate),
            format!("{}", s.immediate_repair_rate),
            format!("{:.2}", s.furnishing_cost),
            format!("{}", s.mortgage_rate),
            format!("{:.2}", s.monthly_utilities),
            format!("{}", s.yearly_capex_rate),
            format!("{}", s.yearly_maintenance_rate),
            format!("{}", s.management_rate),
            format!("{:.2}", s.down_payment),
            format!("{:.2}", s.upfront_cost),
            format!("{:.2}", s.monthly_mortgage),
            format!("{:.2}", s.monthly_taxes),
            format!("{:.2}", s.monthly_management_fee),
            format!("{:.2}", s.total_monthly_expenses),
            format!("{:.2}", s.gross_monthly_rent),
            format!("{:.2}", s.monthly_cash_flow),
            s.months_to_recoup
                .map(|m| format!("{:.1}", m))
                .unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    info!("💾 Exported {} scenarios to {}", scenarios.len(), filename);
    Ok(())
}

/// Timestamped output filename for a listing's scenario sheet.
pub fn scenario_csv_filename(address: &str) -> String {
    let slug: String = address
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .chars()
        .take(40)
        .collect();

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("output/scenarios_{}_{}.csv", slug, timestamp)
}
