//! Initial gateway schema

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Plans and organizations
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Plan::Table)
                    .if_not_exists()
                    .col(string(Plan::Id).primary_key())
                    .col(string(Plan::Name))
                    .col(big_integer(Plan::BandwidthBytes).default(-1))
                    .col(big_integer(Plan::TunnelHours).default(-1))
                    .col(big_integer(Plan::ConcurrentTunnels).default(-1))
                    .col(big_integer(Plan::Requests).default(-1))
                    .col(integer(Plan::OveragePercent).default(0))
                    .col(integer(Plan::GracePeriodHours).default(0))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Organization::Table)
                    .if_not_exists()
                    .col(string(Organization::Id).primary_key())
                    .col(string(Organization::Name))
                    .col(string_null(Organization::PlanId))
                    .col(text(Organization::IpWhitelist).default("[]"))
                    .col(
                        timestamp_with_time_zone(Organization::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Accounts and applications
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Account::Table)
                    .if_not_exists()
                    .col(string(Account::Id).primary_key())
                    .col(string(Account::Email).unique_key())
                    .col(string_null(Account::OrgId))
                    .col(text(Account::IpWhitelist).default("[]"))
                    .col(boolean(Account::IsActive).default(true))
                    .col(
                        timestamp_with_time_zone(Account::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_account_org_id")
                            .from(Account::Table, Account::OrgId)
                            .to(Organization::Table, Organization::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Application::Table)
                    .if_not_exists()
                    .col(string(Application::Id).primary_key())
                    .col(string(Application::OrgId))
                    .col(string(Application::Name))
                    .col(string(Application::Subdomain).unique_key())
                    .col(string(Application::AuthMode).default("inherit"))
                    .col(boolean_null(Application::RateLimitEnabled))
                    .col(integer_null(Application::RateLimitMaxFailures))
                    .col(big_integer_null(Application::RateLimitWindowSecs))
                    .col(
                        timestamp_with_time_zone(Application::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_application_org_id")
                            .from(Application::Table, Application::OrgId)
                            .to(Organization::Table, Organization::Id)
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
                    .name("idx_application_org_id")
                    .table(Application::Table)
                    .col(Application::OrgId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Credentials: policies, API keys, sessions
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AuthPolicy::Table)
                    .if_not_exists()
                    .col(string(AuthPolicy::OwnerKind))
                    .col(string(AuthPolicy::OwnerId))
                    .col(string(AuthPolicy::PolicyType))
                    .col(boolean(AuthPolicy::AllowApiKey).default(false))
                    .col(text(AuthPolicy::BasicUsers).default("[]"))
                    .col(text_null(AuthPolicy::Oidc))
                    .col(big_integer(AuthPolicy::SessionTtlSecs).default(86400))
                    .col(
                        timestamp_with_time_zone(AuthPolicy::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(AuthPolicy::OwnerKind)
                            .col(AuthPolicy::OwnerId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ApiKey::Table)
                    .if_not_exists()
                    .col(string(ApiKey::Id).primary_key())
                    .col(string(ApiKey::Name))
                    .col(string_null(ApiKey::AccountId))
                    .col(string_null(ApiKey::OrgId))
                    .col(string_null(ApiKey::AppId))
                    .col(string_len(ApiKey::DisplayPrefix, 32))
                    .col(string_len(ApiKey::KeyHash, 64).unique_key())
                    .col(boolean(ApiKey::IsActive).default(true))
                    .col(timestamp_with_time_zone_null(ApiKey::ExpiresAt))
                    .col(timestamp_with_time_zone_null(ApiKey::LastUsedAt))
                    .col(
                        timestamp_with_time_zone(ApiKey::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Session::Table)
                    .if_not_exists()
                    .col(string_len(Session::TokenHash, 64).primary_key())
                    .col(string(Session::Subdomain))
                    .col(string(Session::Identity))
                    .col(string_len(Session::Method, 16))
                    .col(timestamp_with_time_zone(Session::ExpiresAt))
                    .col(
                        timestamp_with_time_zone(Session::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Metering
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(UsageSnapshot::Table)
                    .if_not_exists()
                    .col(string(UsageSnapshot::OrgId))
                    .col(string_len(UsageSnapshot::Granularity, 16))
                    .col(timestamp_with_time_zone(UsageSnapshot::PeriodStart))
                    .col(big_integer(UsageSnapshot::BandwidthBytes).default(0))
                    .col(big_integer(UsageSnapshot::TunnelSeconds).default(0))
                    .col(big_integer(UsageSnapshot::Requests).default(0))
                    .col(big_integer(UsageSnapshot::PeakConcurrent).default(0))
                    .primary_key(
                        Index::create()
                            .col(UsageSnapshot::OrgId)
                            .col(UsageSnapshot::Granularity)
                            .col(UsageSnapshot::PeriodStart),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_usage_snapshot_period")
                    .table(UsageSnapshot::Table)
                    .col(UsageSnapshot::Granularity)
                    .col(UsageSnapshot::PeriodStart)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TunnelRecord::Table)
                    .if_not_exists()
                    .col(string(TunnelRecord::Id).primary_key())
                    .col(string(TunnelRecord::Subdomain))
                    .col(string_len(TunnelRecord::Transport, 16))
                    .col(string_null(TunnelRecord::AccountId))
                    .col(string_null(TunnelRecord::OrgId))
                    .col(string_null(TunnelRecord::AppId))
                    .col(string_null(TunnelRecord::ClientAddr))
                    .col(timestamp_with_time_zone(TunnelRecord::CreatedAt))
                    .col(timestamp_with_time_zone_null(TunnelRecord::ClosedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_record_org_id")
                    .table(TunnelRecord::Table)
                    .col(TunnelRecord::OrgId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TunnelRecord::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UsageSnapshot::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Session::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ApiKey::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthPolicy::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Application::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Account::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Organization::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Plan::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Plan {
    Table,
    Id,
    Name,
    BandwidthBytes,
    TunnelHours,
    ConcurrentTunnels,
    Requests,
    OveragePercent,
    GracePeriodHours,
}

#[derive(DeriveIden)]
enum Organization {
    Table,
    Id,
    Name,
    PlanId,
    IpWhitelist,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Account {
    Table,
    Id,
    Email,
    OrgId,
    IpWhitelist,
    IsActive,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Application {
    Table,
    Id,
    OrgId,
    Name,
    Subdomain,
    AuthMode,
    RateLimitEnabled,
    RateLimitMaxFailures,
    RateLimitWindowSecs,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AuthPolicy {
    Table,
    OwnerKind,
    OwnerId,
    PolicyType,
    AllowApiKey,
    BasicUsers,
    Oidc,
    SessionTtlSecs,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ApiKey {
    Table,
    Id,
    Name,
    AccountId,
    OrgId,
    AppId,
    DisplayPrefix,
    KeyHash,
    IsActive,
    ExpiresAt,
    LastUsedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Session {
    Table,
    TokenHash,
    Subdomain,
    Identity,
    Method,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum UsageSnapshot {
    Table,
    OrgId,
    Granularity,
    PeriodStart,
    BandwidthBytes,
    TunnelSeconds,
    Requests,
    PeakConcurrent,
}

#[derive(DeriveIden)]
enum TunnelRecord {
    Table,
    Id,
    Subdomain,
    Transport,
    AccountId,
    OrgId,
    AppId,
    ClientAddr,
    CreatedAt,
    ClosedAt,
}
