use serde::{Deserialize, Serialize};
use sourced_projections::{Document, ProjectionEvent, ProjectionHandlers};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OrderEvent {
    Placed { order: String, customer: String },
    LineAdded { order: String, sku: String },
    Archived { order: String },
}

impl OrderEvent {
    pub fn order(&self) -> String {
        match self {
            OrderEvent::Placed { order, .. }
            | OrderEvent::LineAdded { order, .. }
            | OrderEvent::Archived { order } => order.clone(),
        }
    }
}

impl ProjectionEvent for OrderEvent {
    fn event_type(&self) -> &str {
        match self {
            OrderEvent::Placed { .. } => "Placed",
            OrderEvent::LineAdded { .. } => "LineAdded",
            OrderEvent::Archived { .. } => "Archived",
        }
    }
}

pub fn placed(order: &str, customer: &str) -> OrderEvent {
    OrderEvent::Placed {
        order: order.into(),
        customer: customer.into(),
    }
}

pub fn line(order: &str, sku: &str) -> OrderEvent {
    OrderEvent::LineAdded {
        order: order.into(),
        sku: sku.into(),
    }
}

pub fn archived(order: &str) -> OrderEvent {
    OrderEvent::Archived { order: order.into() }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "order_views")]
pub struct OrderView {
    pub customer: String,
    pub lines: Vec<String>,
    pub last_position: Option<u64>,
}

pub fn order_handlers() -> ProjectionHandlers<String, OrderView, OrderEvent> {
    ProjectionHandlers::new()
        .on("Placed", OrderEvent::order, |event, _, position| {
            let OrderEvent::Placed { customer, .. } = event else {
                return Ok(None);
            };
            Ok(Some(OrderView {
                customer: customer.clone(),
                lines: Vec::new(),
                last_position: position,
            }))
        })
        .on("LineAdded", OrderEvent::order, |event, doc, position| {
            let OrderEvent::LineAdded { sku, .. } = event else {
                return Ok(doc);
            };
            let mut view = doc.unwrap_or_default();
            view.lines.push(sku.clone());
            view.last_position = position;
            Ok(Some(view))
        })
        .on("Archived", OrderEvent::order, |_, _, _| Ok(None))
}
