//! Discord voice transport using serenity and songbird
//!
//! The bot follows people into voice: when a member joins a voice channel in
//! a guild without a session, it joins that channel and starts a session;
//! when the last tracked member leaves, the session is flushed and the bot
//! leaves. Slash commands are answered from the [`CommandRegistry`].

mod receiver;
mod sink;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serenity::Client;
use serenity::all::{
    ChannelId, Command, Context, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, EventHandler, GatewayIntents, GuildId, Interaction, Ready,
    UserId, VoiceState,
};
use songbird::driver::DecodeMode;
use songbird::serenity::SerenityInit;
use songbird::{CoreEvent, Event, Songbird};
use tokio::sync::Mutex;

pub use receiver::VoiceReceiver;
pub use sink::SongbirdSink;

use crate::commands::CommandRegistry;
use crate::control::{ControlChannel, ControlRouter, RouteId};
use crate::coordinator::{Session, SessionHandle};
use crate::voice::CaptureConfig;
use crate::{Error, Result};

/// One guild's voice session
struct GuildSession {
    channel: ChannelId,
    members: HashSet<UserId>,
    route: RouteId,
    session: SessionHandle,
}

struct BotState {
    capture: CaptureConfig,
    router: ControlRouter,
    manager: Arc<Songbird>,
    commands: CommandRegistry,
    sessions: Mutex<HashMap<GuildId, GuildSession>>,
    bot_id: OnceLock<UserId>,
}

impl BotState {
    /// Track `user` in `channel`, joining it if the guild has no session
    ///
    /// `present` lists the people the cache already saw in the channel.
    async fn member_joined(
        &self,
        guild: GuildId,
        channel: ChannelId,
        user: UserId,
        mut present: HashSet<UserId>,
    ) {
        let mut sessions = self.sessions.lock().await;
        present.insert(user);

        if let Some(existing) = sessions.get_mut(&guild) {
            if existing.channel == channel {
                existing.members.extend(present);
                tracing::debug!(%guild, %user, members = existing.members.len(), "member joined session");
            } else {
                tracing::debug!(%guild, %channel, "already in another voice channel");
            }
            return;
        }

        tracing::info!(%guild, %channel, %user, "member joined voice, joining channel");
        match self.start_session(guild, channel).await {
            Ok((route, session)) => {
                sessions.insert(
                    guild,
                    GuildSession {
                        channel,
                        members: present,
                        route,
                        session,
                    },
                );
            }
            Err(e) => {
                tracing::error!(%guild, %channel, kind = ?e.kind(), error = %e, "failed to join voice channel");
            }
        }
    }

    /// Stop tracking `user`; leave once nobody is left
    async fn member_left(&self, guild: GuildId, channel: ChannelId, user: UserId) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(existing) = sessions.get_mut(&guild) else {
                return;
            };
            if existing.channel != channel {
                return;
            }
            existing.members.remove(&user);
            if !existing.members.is_empty() {
                return;
            }
            sessions.remove(&guild)
        };

        if let Some(ended) = session {
            tracing::info!(%guild, %user, "last member left, leaving voice");
            self.end_session(guild, ended).await;
        }
    }

    async fn start_session(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<(RouteId, SessionHandle)> {
        let call = self
            .manager
            .join(guild, channel)
            .await
            .map_err(|e| Error::Discord(format!("voice join error: {e}")))?;

        let route = self.router.attach();
        let session = Session::spawn(
            self.capture.clone(),
            Arc::new(SongbirdSink::new(Arc::clone(&call))),
            route.sink,
            route.inbound,
        );

        let receiver = VoiceReceiver::new(session.sender());
        {
            let mut call = call.lock().await;
            for event in [
                CoreEvent::VoiceTick,
                CoreEvent::SpeakingStateUpdate,
                CoreEvent::ClientDisconnect,
            ] {
                call.add_global_event(Event::Core(event), receiver.clone());
            }
        }

        tracing::info!(%guild, %channel, route = route.id, "voice receiver registered");
        Ok((route.id, session))
    }

    async fn end_session(&self, guild: GuildId, ended: GuildSession) {
        ended.session.leave().await;
        self.router.detach(ended.route);
        if let Err(e) = self.manager.remove(guild).await {
            tracing::warn!(%guild, error = %e, "failed to leave voice channel");
        }
    }

    /// Flush and leave every guild
    async fn leave_all(&self) {
        let sessions: Vec<(GuildId, GuildSession)> =
            self.sessions.lock().await.drain().collect();
        for (guild, ended) in sessions {
            self.end_session(guild, ended).await;
        }
    }

    fn is_self(&self, user: UserId) -> bool {
        self.bot_id.get().is_some_and(|id| *id == user)
    }
}

/// People in `channel` among `(user, channel, is_bot)` voice states
fn occupants(
    states: impl IntoIterator<Item = (UserId, Option<ChannelId>, bool)>,
    channel: ChannelId,
    bot: Option<UserId>,
) -> HashSet<UserId> {
    states
        .into_iter()
        .filter(|(user, at, is_bot)| *at == Some(channel) && !is_bot && Some(*user) != bot)
        .map(|(user, ..)| user)
        .collect()
}

/// serenity event handler
struct Handler(Arc<BotState>);

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        let _ = self.0.bot_id.set(ready.user.id);
        tracing::info!(user = %ready.user.name, "Discord bot ready");

        let commands: Vec<CreateCommand> = self
            .0
            .commands
            .definitions()
            .map(|(name, description)| CreateCommand::new(name).description(description))
            .collect();

        match Command::set_global_commands(&ctx.http, commands).await {
            Ok(registered) => tracing::info!(count = registered.len(), "slash commands registered"),
            Err(e) => tracing::error!(error = %e, "failed to register slash commands"),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };

        let reply = self.0.commands.dispatch(&command.data.name);
        let response = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content(reply.content)
                .ephemeral(reply.ephemeral),
        );

        if let Err(e) = command.create_response(&ctx.http, response).await {
            tracing::warn!(name = %command.data.name, error = %e, "failed to answer command");
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let is_bot = new.member.as_ref().is_some_and(|m| m.user.bot);
        if is_bot || self.0.is_self(new.user_id) {
            return;
        }
        let Some(guild) = new.guild_id else {
            return;
        };

        let before = old.and_then(|o| o.channel_id);
        let after = new.channel_id;
        if before == after {
            return;
        }

        if let Some(channel) = before {
            self.0.member_left(guild, channel, new.user_id).await;
        }
        if let Some(channel) = after {
            let present = ctx
                .cache
                .guild(guild)
                .map(|cached| {
                    let states = cached.voice_states.values().map(|state| {
                        let is_bot = state.member.as_ref().is_some_and(|m| m.user.bot);
                        (state.user_id, state.channel_id, is_bot)
                    });
                    occupants(states, channel, self.0.bot_id.get().copied())
                })
                .unwrap_or_default();
            self.0
                .member_joined(guild, channel, new.user_id, present)
                .await;
        }
    }
}

/// Run the Discord bot until the gateway stops or Ctrl-C is pressed
///
/// # Errors
///
/// Returns error if the client cannot be built or the gateway fails
pub async fn run(token: &str, capture: CaptureConfig, control: Arc<ControlChannel>) -> Result<()> {
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let manager = Songbird::serenity_from_config(
        songbird::Config::default().decode_mode(DecodeMode::Decode),
    );

    // Sessions share the one link; the router keeps replies with their session
    let router = ControlRouter::new(Arc::new(control.handle()), control.subscribe());
    let state = Arc::new(BotState {
        capture,
        router,
        manager: Arc::clone(&manager),
        commands: CommandRegistry::with_defaults(),
        sessions: Mutex::new(HashMap::new()),
        bot_id: OnceLock::new(),
    });

    let mut client = Client::builder(token, intents)
        .event_handler(Handler(Arc::clone(&state)))
        .register_songbird_with(manager)
        .await
        .map_err(|e| Error::Discord(format!("Discord client error: {e}")))?;

    let shards = Arc::clone(&client.shard_manager);

    tokio::select! {
        result = client.start() => {
            result.map_err(|e| Error::Discord(format!("Discord gateway error: {e}")))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            state.leave_all().await;
            shards.shutdown_all().await;
        }
    }

    Ok(())
}
