//! Shared fixtures for the scenario tests under `tests/`.
//!
//! `seed_world` builds one complete tenant: an approved firm with credits
//! and a Johannesburg coverage square, a team with a field agent, an
//! office user, a verified end user owning a covered group with a rostered
//! phone, and an applied subscription. Every identifier is salted so
//! repeated runs against a shared database never collide.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use aegis_auth::hash_password;
use aegis_db::firms::{self, ProviderTypeRow};
use aegis_db::groups;
use aegis_db::principals::{insert_principal, mark_verified, NewPrincipal};
use aegis_db::subscriptions;
use aegis_geo::validate_ring;
use aegis_types::{FirmRole, FirmVerification, GeoPoint, MembershipRole, PhoneKind, PrincipalKind};

/// The canonical seeded point: central Johannesburg.
pub fn home_point() -> GeoPoint {
    GeoPoint::new(28.047, -26.204)
}

/// A square safely containing `home_point`.
pub fn jhb_ring() -> Vec<GeoPoint> {
    validate_ring(&[
        GeoPoint::new(27.9, -26.4),
        GeoPoint::new(28.2, -26.4),
        GeoPoint::new(28.2, -26.0),
        GeoPoint::new(27.9, -26.0),
    ])
    .expect("fixture ring is valid")
}

pub struct SeededWorld {
    pub firm_id: Uuid,
    pub team_id: Uuid,
    pub product_id: Uuid,
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub user_phone: String,
    pub office_id: Uuid,
    pub agent_id: Uuid,
    pub stored_subscription_id: Uuid,
    pub provider_type_code: String,
    pub provider_id: Uuid,
}

fn salted_phone(id: Uuid) -> String {
    // E.164-shaped, unique per run.
    format!("+27{:09}", id.as_u128() % 1_000_000_000)
}

pub async fn seed_principal(
    pool: &PgPool,
    kind: PrincipalKind,
    firm_id: Option<Uuid>,
    role: Option<FirmRole>,
) -> Result<(Uuid, String)> {
    let id = Uuid::new_v4();
    let salt = id.simple().to_string();
    let phone = salted_phone(id);
    insert_principal(
        pool,
        &NewPrincipal {
            principal_id: id,
            kind,
            email: format!("u-{salt}@example.test"),
            phone: phone.clone(),
            password_hash: hash_password("Str0ng!pass")?,
            firm_id,
            firm_role: role,
        },
    )
    .await?;
    mark_verified(pool, id).await?;
    Ok((id, phone))
}

/// Seed the S1 world: approved firm, credit 100, polygon covering
/// (28.047, −26.204), product (price 100, credit_cost 10, max_users 5),
/// verified owner with rostered phone, subscription applied.
pub async fn seed_world(pool: &PgPool) -> Result<SeededWorld> {
    let firm_id = Uuid::new_v4();
    firms::insert_firm(pool, firm_id, "Sentinel Response", "2019/123456/07").await?;
    firms::set_firm_verification(pool, firm_id, FirmVerification::Approved).await?;

    {
        let mut tx = pool.begin().await?;
        firms::fetch_firm_for_update(&mut tx, firm_id).await?;
        firms::apply_credit_delta(&mut tx, firm_id, 100, "seed", None).await?;
        tx.commit().await?;
    }

    firms::insert_coverage_area(pool, Uuid::new_v4(), firm_id, "Johannesburg", &jhb_ring()).await?;

    let (agent_id, _) = seed_principal(
        pool,
        PrincipalKind::FirmMember,
        Some(firm_id),
        Some(FirmRole::FieldAgent),
    )
    .await?;
    let (office_id, _) = seed_principal(
        pool,
        PrincipalKind::FirmMember,
        Some(firm_id),
        Some(FirmRole::FirmUser),
    )
    .await?;

    let team_id = Uuid::new_v4();
    firms::insert_team(pool, team_id, firm_id, "Alpha", agent_id).await?;

    // A security provider so the coverage snapshot lists the service.
    let provider_type_id = Uuid::new_v4();
    let provider_type_code = format!("security-{}", &provider_type_id.simple().to_string()[..8]);
    firms::insert_provider_type(
        pool,
        &ProviderTypeRow {
            provider_type_id,
            code: provider_type_code.clone(),
            display_name: "Armed response".to_string(),
            service_type: aegis_types::ServiceType::Security,
            default_radius_km: 30.0,
            priority: 1,
            active: true,
        },
    )
    .await?;
    let provider_id = Uuid::new_v4();
    firms::insert_provider(
        pool,
        &firms::ProviderRow {
            provider_id,
            firm_id,
            provider_type_id,
            name: "Unit 7".to_string(),
            current_position: GeoPoint::new(28.05, -26.21),
            coverage_radius_km: 30.0,
            status: aegis_types::ProviderStatus::Available,
            active: true,
        },
        GeoPoint::new(28.05, -26.21),
    )
    .await?;

    let (user_id, user_phone) = seed_principal(pool, PrincipalKind::EndUser, None, None).await?;

    let group_id = Uuid::new_v4();
    groups::insert_group_with_owner(pool, group_id, "Home", "1 Main Rd", home_point(), user_id)
        .await?;
    groups::insert_group_phone(pool, Uuid::new_v4(), group_id, &user_phone, PhoneKind::Individual)
        .await?;

    let product_id = Uuid::new_v4();
    subscriptions::insert_product(
        pool,
        &subscriptions::ProductRow {
            product_id,
            firm_id,
            name: "Home Basic".to_string(),
            max_users: 5,
            price_cents: 100,
            credit_cost: 10,
            active: true,
        },
    )
    .await?;

    let stored_subscription_id = Uuid::new_v4();
    subscriptions::insert_stored_subscription(pool, stored_subscription_id, user_id, product_id)
        .await?;

    let snapshot = aegis_db::snapshot::load_coverage_snapshot(pool).await?;
    let settings = aegis_config::Settings::default();
    aegis_ledger::apply_subscription(
        pool,
        &snapshot,
        &settings,
        user_id,
        stored_subscription_id,
        group_id,
    )
    .await
    .map_err(|e| anyhow::anyhow!("seed apply failed: {e}"))?;

    Ok(SeededWorld {
        firm_id,
        team_id,
        product_id,
        group_id,
        user_id,
        user_phone,
        office_id,
        agent_id,
        stored_subscription_id,
        provider_type_code,
        provider_id,
    })
}

/// Add a secondary member with a rostered phone to an existing group.
pub async fn seed_member(pool: &PgPool, group_id: Uuid) -> Result<(Uuid, String)> {
    let (user_id, phone) = seed_principal(pool, PrincipalKind::EndUser, None, None).await?;
    groups::insert_membership(pool, group_id, user_id, MembershipRole::Member).await?;
    groups::insert_group_phone(pool, Uuid::new_v4(), group_id, &phone, PhoneKind::Individual)
        .await?;
    Ok((user_id, phone))
}

/// Office-staff actor for dispatch calls.
pub fn office_actor(world: &SeededWorld) -> aegis_dispatch::Actor {
    aegis_dispatch::Actor {
        principal_id: world.office_id,
        kind: PrincipalKind::FirmMember,
        firm_id: Some(world.firm_id),
        role: Some(FirmRole::FirmUser),
    }
}

/// Field-agent actor (member of the seeded team).
pub fn agent_actor(world: &SeededWorld) -> aegis_dispatch::Actor {
    aegis_dispatch::Actor {
        principal_id: world.agent_id,
        kind: PrincipalKind::FirmMember,
        firm_id: Some(world.firm_id),
        role: Some(FirmRole::FieldAgent),
    }
}
