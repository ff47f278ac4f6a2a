//! Applying startup parameters to a running world.

use std::sync::Arc;

use worldhost_common::models::{StartupParameters, WorldSettings};
use worldhost_common::validation::{is_valid_cloud_variable_path, is_valid_session_id};

use crate::engine::{Engine, EngineError, World};

/// Merge startup parameters onto the world's current settings.
///
/// Invalid cloud variable paths and parent session ids are logged and skipped.
pub fn settings_from_parameters(params: &StartupParameters, current: WorldSettings) -> WorldSettings {
    let mut settings = current;

    if let Some(name) = &params.session_name {
        settings.name = name.clone();
    }
    if let Some(tags) = &params.tags {
        settings.tags = tags.clone();
    }
    settings.access_level = params.access_level;
    settings.use_custom_join_verifier = params.use_custom_join_verifier;
    settings.hide_from_listing = params.hide_from_public_listing == Some(true);
    settings.max_users = params.max_users;
    settings.mobile_friendly = params.mobile_friendly;
    settings.description = params.description.clone();
    settings.auto_sleep = params.auto_sleep;
    settings.save_on_exit = params.save_on_exit;

    if let Some(id) = params
        .override_corresponding_world_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
    {
        settings.corresponding_world_id = Some(id.to_owned());
    }

    settings.away_kick_minutes = (params.away_kick_minutes > 0.0).then_some(params.away_kick_minutes as f32);

    settings.role_cloud_variable = cloud_variable("role", &params.role_cloud_variable);
    settings.allow_user_cloud_variable = cloud_variable("allow user", &params.allow_user_cloud_variable);
    settings.deny_user_cloud_variable = cloud_variable("deny user", &params.deny_user_cloud_variable);
    settings.required_user_join_cloud_variable =
        cloud_variable("required join", &params.required_user_join_cloud_variable);
    settings.required_user_join_cloud_variable_deny_message =
        params.required_user_join_cloud_variable_deny_message.clone();

    settings.parent_session_ids = params
        .parent_session_ids
        .iter()
        .filter(|id| {
            let valid = is_valid_session_id(id);
            if !valid {
                tracing::warn!(parent = %id, "Parent session id is invalid");
            }
            valid
        })
        .cloned()
        .collect();

    settings
}

fn cloud_variable(kind: &str, path: &Option<String>) -> Option<String> {
    let path = path.as_deref().map(str::trim).filter(|p| !p.is_empty())?;
    if is_valid_cloud_variable_path(path) {
        Some(path.to_owned())
    } else {
        tracing::warn!(kind, path, "Invalid cloud variable path, ignoring");
        None
    }
}

/// Apply `params` to a running world. World mutations run on the engine context;
/// invites are sent afterwards from the calling task.
pub async fn apply_parameters(
    engine: &dyn Engine,
    world: &Arc<dyn World>,
    params: &StartupParameters,
) -> Result<(), EngineError> {
    let logged_in = engine.current_user_id().is_some();
    let settings = settings_from_parameters(params, world.settings());

    let mut handlers = settings.invite_request_handlers.clone();
    if !params.invite_request_handler_usernames.is_empty() {
        if logged_in {
            for username in &params.invite_request_handler_usernames {
                if !handlers.contains(username) {
                    tracing::info!(username = %username, "Added as invite request handler");
                    handlers.push(username.clone());
                }
            }
        } else {
            tracing::warn!("Not logged in, cannot forward invite requests");
        }
    }
    let settings = WorldSettings {
        invite_request_handlers: handlers,
        ..settings
    };

    let target = world.clone();
    let intent = params.clone();
    engine
        .context()
        .run(move || {
            target.apply_settings(settings);

            if !intent.keep_original_roles {
                target.clear_default_roles();
            }
            for (user, role) in &intent.default_user_roles {
                if let Err(e) = target.set_default_role(user, role) {
                    tracing::warn!(user = %user, role = %role, error = %e, "Cannot assign default role");
                }
            }

            for user_id in &intent.join_allowed_user_ids {
                target.allow_user_to_join(user_id);
                tracing::info!(user = %user_id, "Allowed to join");
            }
        })
        .await?;

    send_automatic_invites(engine, world, params, logged_in).await;
    Ok(())
}

async fn send_automatic_invites(
    engine: &dyn Engine,
    world: &Arc<dyn World>,
    params: &StartupParameters,
    logged_in: bool,
) {
    if params.auto_invite_usernames.is_empty() {
        return;
    }
    if !logged_in {
        tracing::warn!("Not logged in, cannot send auto-invites");
        return;
    }

    for username in &params.auto_invite_usernames {
        let target = world.clone();
        let user = username.clone();
        if let Err(e) = engine
            .context()
            .run(move || target.allow_user_to_join(&user))
            .await
        {
            tracing::warn!(username = %username, error = %e, "Cannot allow invited user");
            continue;
        }

        let target = world.clone();
        let user = username.clone();
        let message = params.auto_invite_message.clone();
        match engine
            .context()
            .start(move || target.send_invite(&user, message.as_deref()))
            .await
        {
            Ok(()) => tracing::info!(username = %username, "Invited"),
            Err(e) => tracing::warn!(username = %username, error = %e, "Failed to send auto-invite"),
        }
    }
}
