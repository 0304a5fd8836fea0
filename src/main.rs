//! Voice tutor host process.
//!
//! Communicates with the host application via JSON-line IPC on stdin/stdout.
//! The voice controller runs its own control loop; this file only translates
//! IPC commands into controller commands and notifications into IPC events.

use tokio::sync::mpsc;
use tracing::{info, warn};

use voice_tutor::audio::devices::{list_input_devices, list_output_devices};
use voice_tutor::audio::{CpalInput, RodioOutput};
use voice_tutor::config::{load_config, paths};
use voice_tutor::controller::events::ControlCommand;
use voice_tutor::ipc::bridge::{emit_event, spawn_stdin_reader};
use voice_tutor::ipc::{TutorCommand, TutorEvent};
use voice_tutor::tutor::{Language, LiveClient};
use voice_tutor::{logger, Notification, VoiceController, VoiceSessionState};

/// What the host last heard from the controller, for `status` replies.
struct Mirror {
    state: VoiceSessionState,
    speaking: bool,
}

impl Mirror {
    fn apply(&mut self, notification: &Notification) {
        match notification {
            Notification::StateChanged(state) => self.state = *state,
            Notification::SpeakingChanged(speaking) => self.speaking = *speaking,
            Notification::Error(_) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = logger::init(&paths::get_log_dir()) {
        eprintln!("Logger not initialized: {}", e);
    }

    // Emit starting event immediately so the host knows we're alive.
    emit_event(&TutorEvent::Starting {});

    let config = load_config();
    info!(
        config_path = %voice_tutor::config::get_config_path().display(),
        live = ?config.live_config(),
        "Configuration loaded"
    );
    if !config.has_api_key() {
        warn!("No API key configured; sessions will fail to connect");
    }

    let mut output = RodioOutput::new(config.output_device.clone());
    if let Some(volume) = config.output_volume {
        output = output.with_volume(volume);
    }
    let (mut controller, mut notifications) = VoiceController::new(
        CpalInput::new(config.input_device.clone()),
        output,
        LiveClient::new(config.live_config()),
        config.controller_options(),
    );

    let mut cmd_rx = spawn_stdin_reader();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let default_language = config.language();

    emit_event(&TutorEvent::Ready {});
    info!("Voice tutor ready");

    let host = async {
        let mut mirror = Mirror {
            state: VoiceSessionState::Idle,
            speaking: false,
        };
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(command) => {
                        if !handle_command(command, &control_tx, &mirror, default_language) {
                            break;
                        }
                    }
                    None => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                },
                Some(notification) = notifications.recv() => {
                    mirror.apply(&notification);
                    emit_event(&TutorEvent::from(&notification));
                }
            }
        }
        let _ = control_tx.send(ControlCommand::Shutdown);
    };

    tokio::join!(controller.run(control_rx), host);

    // Notifications raised while the last session was torn down.
    while let Ok(notification) = notifications.try_recv() {
        emit_event(&TutorEvent::from(&notification));
    }

    info!("Voice tutor shutting down");
    Ok(())
}

/// Handle a single command from the host.
/// Returns `false` if the host loop should exit.
fn handle_command(
    cmd: TutorCommand,
    control: &mpsc::UnboundedSender<ControlCommand>,
    mirror: &Mirror,
    default_language: Language,
) -> bool {
    match cmd {
        TutorCommand::StartSession { context, language } => {
            let language = language.unwrap_or(default_language);
            info!(language = %language, context_chars = context.chars().count(), "Session start requested");
            let _ = control.send(ControlCommand::Start { context, language });
        }

        TutorCommand::StopSession {} => {
            info!("Session stop requested");
            let _ = control.send(ControlCommand::Stop);
        }

        TutorCommand::Status {} => {
            emit_event(&TutorEvent::status(mirror.state, mirror.speaking));
        }

        TutorCommand::ListAudioDevices {} => {
            emit_event(&TutorEvent::AudioDevices {
                input: list_input_devices(),
                output: list_output_devices(),
            });
        }

        TutorCommand::Ping {} => {
            emit_event(&TutorEvent::Pong {});
        }

        TutorCommand::Shutdown {} => {
            emit_event(&TutorEvent::Stopping {});
            return false;
        }
    }

    true
}
