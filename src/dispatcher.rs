//! Parses inbound commands, validates them against live permissions,
//! commits Store mutations inside a transaction, and hands the
//! resulting event off to the Broadcaster.
//!
//! Every command follows the same sequence (§4.4): load-within-
//! transaction → authorize → mutate → collect event + audience →
//! commit → broadcast. The load-authorize-mutate portion runs as one
//! `sqlx` transaction inside the relevant `Store` method, so nothing
//! here ever authorizes against one read and mutates against a later,
//! possibly stale one. Authorization always uses freshly-read
//! permissions — nothing here is cached across calls.

use std::collections::HashSet;

use serde_json::json;
use tracing::instrument;

use crate::authz;
use crate::error::AlarmError;
use crate::protocol::{
    AlarmAction, CreateAlarmPayload, CreatePagePayload, DeleteAlarmPayload, InboundMessage,
    OutboundMessage, PageSummary, SharePagePayload, TriggerAlarmPayload, UnsharePagePayload,
    UpdateAlarmPayload,
};
use crate::session::SessionHandle;
use crate::AppContext;

/// Identifies the connection issuing a command. Passed explicitly
/// rather than read off ambient/thread-local state, per the design
/// note on auditable authorization (spec §9).
#[derive(Debug, Clone)]
pub struct SessionCtx {
    pub user_id: String,
    pub session_id: String,
}

#[instrument(skip(app, handle, msg), fields(user_id = %ctx.user_id))]
pub async fn dispatch(
    ctx: &SessionCtx,
    handle: &SessionHandle,
    msg: InboundMessage,
    app: &AppContext,
) -> Result<(), AlarmError> {
    match msg {
        InboundMessage::CreateAlarm(p) => create_alarm(ctx, handle, p, app).await,
        InboundMessage::UpdateAlarm(p) => update_alarm(ctx, handle, p, app).await,
        InboundMessage::DeleteAlarm(p) => delete_alarm(ctx, handle, p, app).await,
        InboundMessage::TriggerAlarm(p) => trigger_alarm(ctx, handle, p, app).await,
        InboundMessage::CreatePage(p) => create_page(ctx, handle, p, app).await,
        InboundMessage::SharePage(p) => share_page(ctx, handle, p, app).await,
        InboundMessage::UnsharePage(p) => unshare_page(ctx, handle, p, app).await,
    }
}

async fn create_alarm(
    ctx: &SessionCtx,
    handle: &SessionHandle,
    p: CreateAlarmPayload,
    app: &AppContext,
) -> Result<(), AlarmError> {
    let alarm = app
        .store
        .create_alarm(&p.page_id, &p.ticker, &p.option, &p.condition, &ctx.user_id)
        .await?;

    app.broadcaster
        .broadcast_to_page(
            &p.page_id,
            OutboundMessage::AlarmUpdate {
                alarm_id: alarm.id.clone(),
                page_id: alarm.page_id.clone(),
                action: AlarmAction::Created,
                data: json!(alarm),
            },
        )
        .await?;

    let _ = handle;
    Ok(())
}

async fn update_alarm(
    ctx: &SessionCtx,
    _handle: &SessionHandle,
    p: UpdateAlarmPayload,
    app: &AppContext,
) -> Result<(), AlarmError> {
    let alarm = app
        .store
        .update_alarm(
            &p.alarm_id,
            &ctx.user_id,
            p.ticker.as_deref(),
            p.option.as_deref(),
            p.condition.as_deref(),
            p.active,
        )
        .await?;

    app.broadcaster
        .broadcast_to_page(
            &alarm.page_id,
            OutboundMessage::AlarmUpdate {
                alarm_id: alarm.id.clone(),
                page_id: alarm.page_id.clone(),
                action: AlarmAction::Updated,
                data: json!(alarm),
            },
        )
        .await?;

    Ok(())
}

async fn delete_alarm(
    ctx: &SessionCtx,
    _handle: &SessionHandle,
    p: DeleteAlarmPayload,
    app: &AppContext,
) -> Result<(), AlarmError> {
    let page_id = app.store.delete_alarm(&p.alarm_id, &ctx.user_id).await?;

    app.broadcaster
        .broadcast_to_page(
            &page_id,
            OutboundMessage::AlarmUpdate {
                alarm_id: p.alarm_id.clone(),
                page_id: page_id.clone(),
                action: AlarmAction::Deleted,
                data: json!({ "id": p.alarm_id, "page_id": page_id }),
            },
        )
        .await?;

    Ok(())
}

async fn trigger_alarm(
    ctx: &SessionCtx,
    _handle: &SessionHandle,
    p: TriggerAlarmPayload,
    app: &AppContext,
) -> Result<(), AlarmError> {
    let (alarm, event) = app.store.trigger_alarm(&p.alarm_id, &ctx.user_id, p.price).await?;

    let mut data = json!(alarm);
    data["price"] = json!(event.price);
    data["triggered_by"] = json!(event.triggered_by);

    app.broadcaster
        .broadcast_to_page(
            &alarm.page_id,
            OutboundMessage::AlarmUpdate {
                alarm_id: alarm.id.clone(),
                page_id: alarm.page_id.clone(),
                action: AlarmAction::Triggered,
                data,
            },
        )
        .await?;

    Ok(())
}

async fn create_page(
    ctx: &SessionCtx,
    handle: &SessionHandle,
    p: CreatePagePayload,
    app: &AppContext,
) -> Result<(), AlarmError> {
    let page = app.store.create_page(&p.name, &ctx.user_id).await?;

    app.broadcaster
        .deliver_to_session(
            handle,
            OutboundMessage::Success {
                action: "page_created".to_string(),
                data: json!(page),
            },
        )
        .await;

    Ok(())
}

async fn share_page(
    ctx: &SessionCtx,
    handle: &SessionHandle,
    p: SharePagePayload,
    app: &AppContext,
) -> Result<(), AlarmError> {
    let subject = p.subject_type.with_id(p.subject_id.clone());
    let (before, after) = app
        .store
        .share_page(&p.page_id, &ctx.user_id, &subject, p.can_view, p.can_edit)
        .await?;

    apply_audience_diff(app, &p.page_id, &before, &after).await?;

    app.broadcaster
        .deliver_to_session(
            handle,
            OutboundMessage::Success {
                action: "page_shared".to_string(),
                data: json!({ "page_id": p.page_id }),
            },
        )
        .await;

    Ok(())
}

async fn unshare_page(
    ctx: &SessionCtx,
    handle: &SessionHandle,
    p: UnsharePagePayload,
    app: &AppContext,
) -> Result<(), AlarmError> {
    let subject = p.subject_type.with_id(p.subject_id.clone());
    let (before, after) = app.store.unshare_page(&p.page_id, &ctx.user_id, &subject).await?;

    apply_audience_diff(app, &p.page_id, &before, &after).await?;

    app.broadcaster
        .deliver_to_session(
            handle,
            OutboundMessage::Success {
                action: "page_unshared".to_string(),
                data: json!({ "page_id": p.page_id }),
            },
        )
        .await;

    Ok(())
}

/// Diff procedure shared by `share_page`/`unshare_page`: users newly in
/// the audience get a full snapshot (`page_access_granted`); users newly
/// out get `page_access_revoked`. An identical-flags `share_page` call
/// leaves the audience unchanged and so emits no diff frames.
async fn apply_audience_diff(
    app: &AppContext,
    page_id: &str,
    before: &HashSet<String>,
    after: &HashSet<String>,
) -> Result<(), AlarmError> {
    let page = app.store.get_page(page_id).await?;

    for user_id in after.difference(before) {
        let groups = app.store.list_groups_of_user(user_id).await?;
        let perms = app.store.list_permissions(page_id).await?;
        let verdict = authz::resolve(user_id, &page, &perms, &groups);
        let alarms = app
            .store
            .list_alarms_in_pages(&HashSet::from([page_id.to_string()]))
            .await?;

        let mut ids = HashSet::new();
        ids.insert(user_id.clone());
        app.broadcaster
            .deliver_to_users(
                &ids,
                OutboundMessage::PageAccessGranted {
                    page: PageSummary::new(&page, false, verdict.edit),
                    alarms: alarms.clone(),
                },
            )
            .await;
    }

    let revoked: HashSet<String> = before.difference(after).cloned().collect();
    if !revoked.is_empty() {
        app.broadcaster
            .deliver_to_users(
                &revoked,
                OutboundMessage::PageAccessRevoked { page_id: page_id.to_string() },
            )
            .await;
    }

    Ok(())
}
