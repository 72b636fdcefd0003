//! User entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub email: String,

    /// Exempt from the daily bandwidth limit.
    pub bandwidth_exempt: bool,

    /// Tunnels are refused until the user accepts the terms of service.
    pub terms_accepted: bool,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::auth_token::Entity")]
    AuthToken,

    #[sea_orm(has_many = "super::domain::Entity")]
    Domain,

    #[sea_orm(has_many = "super::user_bandwidth::Entity")]
    UserBandwidth,
}

impl Related<super::auth_token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AuthToken.def()
    }
}

impl Related<super::domain::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Domain.def()
    }
}

impl Related<super::user_bandwidth::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserBandwidth.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
