use std::collections::HashMap;

use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::info;

use super::models::PaymentMethodRow;

/// key: billing-payment-method-catalog -> lookup table loaded once at startup
///
/// Tenant-specific rows shadow shared rows (`tenant_id IS NULL`) with the same code.
#[derive(Debug, Clone, Default)]
pub struct PaymentMethodCatalog {
    by_code: HashMap<(Option<i64>, String), PaymentMethodRow>,
    by_gateway_type: HashMap<(Option<i64>, String), String>,
}

impl PaymentMethodCatalog {
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows = sqlx::query_as::<_, PaymentMethodRow>(
            r#"
            SELECT id, tenant_id, code, name, discount_percent, gateway_payment_type
            FROM payment_methods
            ORDER BY id
            "#,
        )
        .fetch_all(pool)
        .await?;
        let catalog = Self::from_rows(rows);
        info!(methods = catalog.by_code.len(), "payment method catalog loaded");
        Ok(catalog)
    }

    pub fn from_rows(rows: impl IntoIterator<Item = PaymentMethodRow>) -> Self {
        let mut catalog = Self::default();
        for row in rows {
            let code = normalize(&row.code);
            if let Some(gateway_type) = row.gateway_payment_type.as_deref() {
                catalog
                    .by_gateway_type
                    .insert((row.tenant_id, normalize(gateway_type)), code.clone());
            }
            catalog.by_code.insert((row.tenant_id, code), row);
        }
        catalog
    }

    pub fn method(&self, tenant_id: i64, code: &str) -> Option<&PaymentMethodRow> {
        let code = normalize(code);
        self.by_code
            .get(&(Some(tenant_id), code.clone()))
            .or_else(|| self.by_code.get(&(None, code)))
    }

    pub fn discount_percent(&self, tenant_id: i64, code: &str) -> Decimal {
        self.method(tenant_id, code)
            .map(|method| method.discount_percent)
            .unwrap_or(Decimal::ZERO)
    }

    /// Local method code for a gateway `payment_type_id`.
    pub fn method_for_gateway_type(&self, tenant_id: i64, payment_type: &str) -> String {
        let key = normalize(payment_type);
        if let Some(code) = self
            .by_gateway_type
            .get(&(Some(tenant_id), key.clone()))
            .or_else(|| self.by_gateway_type.get(&(None, key.clone())))
        {
            return code.clone();
        }
        builtin_method(&key).unwrap_or(key)
    }
}

fn builtin_method(payment_type: &str) -> Option<String> {
    let code = match payment_type {
        "credit_card" => "credit_card",
        "debit_card" | "prepaid_card" => "debit_card",
        "pix" | "bank_transfer" => "pix",
        "ticket" | "atm" => "boleto",
        "account_money" => "wallet",
        _ => return None,
    };
    Some(code.to_string())
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
