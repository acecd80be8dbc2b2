//! Create-order command and its validation.

use serde::{Deserialize, Serialize};

use super::{CustomerId, Money, OrderError, OrderItem};

/// Command to create a new order, as received from a caller.
///
/// Fields are deliberately loose so that a missing or malformed value is
/// reported by [`CreateOrder::validate`] rather than by the deserializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default)]
    pub items: Vec<CreateOrderItem>,
}

/// A requested line item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderItem {
    #[serde(default)]
    pub product_id: String,

    #[serde(default)]
    pub quantity: i64,

    /// Unit price in cents.
    #[serde(default)]
    pub price_cents: i64,
}

impl CreateOrderItem {
    pub fn new(product_id: impl Into<String>, quantity: i64, price_cents: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            price_cents,
        }
    }
}

/// A create-order command that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedOrder {
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
}

impl CreateOrder {
    /// Creates a new CreateOrder command.
    pub fn new(customer_id: impl Into<String>, items: Vec<CreateOrderItem>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            items,
        }
    }

    /// Checks the command and converts it into typed line items.
    ///
    /// The customer id must be non-blank, items non-empty, and each item
    /// needs a non-blank product id, a positive quantity and a
    /// non-negative price.
    pub fn validate(&self) -> Result<ValidatedOrder, OrderError> {
        let customer_id = match self.customer_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => CustomerId::new(id),
            _ => return Err(OrderError::CustomerIdRequired),
        };

        if self.items.is_empty() {
            return Err(OrderError::NoItems);
        }

        let items = self
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| item.validate(index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ValidatedOrder { customer_id, items })
    }
}

impl CreateOrderItem {
    fn validate(&self, index: usize) -> Result<OrderItem, OrderError> {
        let product_id = self.product_id.trim();
        if product_id.is_empty() {
            return Err(OrderError::ProductIdRequired { index });
        }

        let quantity = u32::try_from(self.quantity)
            .ok()
            .filter(|q| *q > 0)
            .ok_or_else(|| OrderError::InvalidQuantity {
                product_id: product_id.to_string(),
                quantity: self.quantity,
            })?;

        if self.price_cents < 0 {
            return Err(OrderError::InvalidPrice {
                product_id: product_id.to_string(),
                price: self.price_cents,
            });
        }

        Ok(OrderItem::new(
            product_id,
            quantity,
            Money::from_cents(self.price_cents),
        ))
    }
}
