//! Session entity
//!
//! Enumerations are stored as text and the transition log as JSONB; the
//! conversions to and from the domain type live here.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::session::{BillingState, Session, TransitionEntry};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    #[sea_orm(column_type = "Text")]
    pub requester_id: String,

    #[sea_orm(column_type = "Text")]
    pub provider_id: String,

    #[sea_orm(column_type = "Text")]
    pub kind: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub previous_status: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub rejected_by: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub ended_by: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub close_reason: Option<String>,

    pub requester_joined: bool,

    pub provider_joined: bool,

    #[sea_orm(column_type = "JsonBinary")]
    pub transition_log: Json,

    pub metering_started_at: Option<DateTimeWithTimeZone>,

    pub last_charged_at: Option<DateTimeWithTimeZone>,

    pub billed_minutes: i64,

    #[sea_orm(column_type = "Decimal(Some((20, 4)))")]
    pub amount_charged: Decimal,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

fn parse<T>(column: &str, raw: &str) -> Result<T, AppError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| AppError::Internal {
        message: format!("corrupt {} column: {}", column, e),
    })
}

fn parse_opt<T>(column: &str, raw: Option<&str>) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.map(|r| parse(column, r)).transpose()
}

impl TryFrom<Model> for Session {
    type Error = AppError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let transition_log: Vec<TransitionEntry> = serde_json::from_value(model.transition_log)?;
        let utc = |ts: DateTimeWithTimeZone| ts.with_timezone(&chrono::Utc);

        Ok(Session {
            kind: parse("kind", &model.kind)?,
            status: parse("status", &model.status)?,
            previous_status: parse_opt("previous_status", model.previous_status.as_deref())?,
            rejected_by: parse_opt("rejected_by", model.rejected_by.as_deref())?,
            ended_by: parse_opt("ended_by", model.ended_by.as_deref())?,
            close_reason: parse_opt("close_reason", model.close_reason.as_deref())?,
            id: model.id,
            requester_id: model.requester_id,
            provider_id: model.provider_id,
            requester_joined: model.requester_joined,
            provider_joined: model.provider_joined,
            transition_log,
            billing: BillingState {
                metering_started_at: model.metering_started_at.map(utc),
                last_charged_at: model.last_charged_at.map(utc),
                billed_minutes: model.billed_minutes,
                amount_charged: model.amount_charged,
            },
            created_at: utc(model.created_at),
            updated_at: utc(model.updated_at),
            version: model.version,
        })
    }
}

impl TryFrom<&Session> for Model {
    type Error = AppError;

    fn try_from(session: &Session) -> Result<Self, Self::Error> {
        Ok(Model {
            id: session.id.clone(),
            requester_id: session.requester_id.clone(),
            provider_id: session.provider_id.clone(),
            kind: session.kind.as_str().to_string(),
            status: session.status.as_str().to_string(),
            previous_status: session.previous_status.map(|s| s.as_str().to_string()),
            rejected_by: session.rejected_by.map(|a| a.as_str().to_string()),
            ended_by: session.ended_by.map(|a| a.as_str().to_string()),
            close_reason: session.close_reason.map(|r| r.as_str().to_string()),
            requester_joined: session.requester_joined,
            provider_joined: session.provider_joined,
            transition_log: serde_json::to_value(&session.transition_log)?,
            metering_started_at: session.billing.metering_started_at.map(Into::into),
            last_charged_at: session.billing.last_charged_at.map(Into::into),
            billed_minutes: session.billing.billed_minutes,
            amount_charged: session.billing.amount_charged,
            created_at: session.created_at.into(),
            updated_at: session.updated_at.into(),
            version: session.version,
        })
    }
}
