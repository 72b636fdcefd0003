//! Initial schema: users, tokens, domains, and daily bandwidth counters.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(big_integer(Users::Id).not_null().auto_increment().primary_key())
                    .col(string(Users::Email).not_null().unique_key())
                    .col(
                        boolean(Users::BandwidthExempt)
                            .not_null()
                            .default(false),
                    )
                    .col(boolean(Users::TermsAccepted).not_null().default(false))
                    .col(
                        timestamp_with_time_zone(Users::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Tokens::Table)
                    .if_not_exists()
                    .col(big_integer(Tokens::Id).not_null().auto_increment().primary_key())
                    .col(big_integer(Tokens::UserId).not_null())
                    .col(string(Tokens::TokenHash).not_null().unique_key())
                    .col(
                        timestamp_with_time_zone(Tokens::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tokens_user_id")
                            .from(Tokens::Table, Tokens::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Domains::Table)
                    .if_not_exists()
                    .col(big_integer(Domains::Id).not_null().auto_increment().primary_key())
                    .col(string(Domains::Name).not_null().unique_key())
                    .col(big_integer(Domains::UserId).not_null())
                    .col(
                        timestamp_with_time_zone(Domains::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_domains_user_id")
                            .from(Domains::Table, Domains::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_domains_user_id")
                    .table(Domains::Table)
                    .col(Domains::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserBandwidths::Table)
                    .if_not_exists()
                    .col(big_integer(UserBandwidths::UserId).not_null())
                    .col(date(UserBandwidths::Date).not_null())
                    .col(big_integer(UserBandwidths::BytesUsed).not_null().default(0))
                    .primary_key(
                        Index::create()
                            .col(UserBandwidths::UserId)
                            .col(UserBandwidths::Date),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_bandwidths_user_id")
                            .from(UserBandwidths::Table, UserBandwidths::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserBandwidths::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Domains::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Email,
    BandwidthExempt,
    TermsAccepted,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tokens {
    Table,
    Id,
    UserId,
    TokenHash,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Domains {
    Table,
    Id,
    Name,
    UserId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum UserBandwidths {
    Table,
    UserId,
    Date,
    BytesUsed,
}
