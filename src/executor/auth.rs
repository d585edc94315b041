// SSH authentication: agent, identity files, password, keyboard-interactive

use std::path::Path;
use std::sync::Arc;

use ssh2::{ErrorCode, KeyboardInteractivePrompt, Prompt, Session};
use tracing::{debug, warn};

use crate::inventory::Host;
use crate::output::errors::DsshError;

/// libssh2 could not read the private key, usually because it is encrypted
const LIBSSH2_ERROR_FILE: i32 = -16;

/// Attempts allowed for keyboard-interactive challenges
const KEYBOARD_INTERACTIVE_ATTEMPTS: usize = 3;

/// Supplies secrets during authentication
///
/// Returning `None` skips the method that asked.
pub trait Prompter: Send + Sync {
    fn password(&self, prompt: &str) -> Option<String>;

    /// One keyboard-interactive answer; `echo` is the server's hint
    fn answer(&self, prompt: &str, echo: bool) -> Option<String>;
}

/// Prompts on the controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn password(&self, prompt: &str) -> Option<String> {
        secret(rpassword::prompt_password(prompt))
    }

    fn answer(&self, prompt: &str, echo: bool) -> Option<String> {
        if !echo {
            return self.password(prompt);
        }

        eprint!("{}", prompt);
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                warn!("failed to read answer: {}", e);
                None
            }
        }
    }
}

/// The secret exactly as typed; rpassword has already dropped the newline
fn secret(read: std::io::Result<String>) -> Option<String> {
    match read {
        Ok(password) => Some(password),
        Err(e) => {
            warn!("failed to read password: {}", e);
            None
        }
    }
}

/// Runs the authentication methods against one session, in order
#[derive(Clone)]
pub struct Authenticator {
    prompter: Arc<dyn Prompter>,
}

impl Authenticator {
    pub fn new(prompter: Arc<dyn Prompter>) -> Self {
        Authenticator { prompter }
    }

    pub fn authenticate(&self, session: &Session, host: &Host) -> Result<(), DsshError> {
        let user = host.user.as_str();
        let summary = host.summary();

        // Also performs "none" authentication, which some servers accept outright
        let methods = match session.auth_methods(user) {
            Ok(methods) => methods.to_string(),
            Err(_) if session.authenticated() => return Ok(()),
            Err(e) => {
                debug!(host = %summary, "could not list auth methods: {}", e);
                "publickey,password,keyboard-interactive".to_string()
            }
        };
        if session.authenticated() {
            return Ok(());
        }
        debug!(host = %summary, methods = %methods, "authenticating");

        if methods.contains("publickey") {
            if self.try_agent(session, host) {
                return Ok(());
            }
            if self.try_identity_files(session, host) {
                return Ok(());
            }
        }

        if methods.contains("password") && self.try_password(session, host) {
            return Ok(());
        }

        if methods.contains("keyboard-interactive") && self.try_keyboard_interactive(session, host)
        {
            return Ok(());
        }

        Err(DsshError::Ssh {
            host: summary,
            message: "Authentication failed".to_string(),
            suggestion: Some(
                "Add your key to ssh-agent, pass --identity, or check the login user".to_string(),
            ),
        })
    }

    fn try_agent(&self, session: &Session, host: &Host) -> bool {
        let mut agent = match session.agent() {
            Ok(agent) => agent,
            Err(e) => {
                warn!("ssh-agent error: {}", e);
                return false;
            }
        };
        if let Err(e) = agent.connect() {
            debug!("ssh-agent not available: {}", e);
            return false;
        }
        if let Err(e) = agent.list_identities() {
            warn!("ssh-agent identities error: {}", e);
            return false;
        }

        let identities = agent.identities().unwrap_or_default();
        let ok = identities.iter().any(|identity| {
            let accepted = agent.userauth(&host.user, identity).is_ok();
            debug!(host = %host.summary(), key = identity.comment(), accepted, "agent key");
            accepted
        });
        // Dropping the connection to the agent is best effort
        let _ = agent.disconnect();
        ok
    }

    fn try_identity_files(&self, session: &Session, host: &Host) -> bool {
        for key in &host.identity_files {
            match session.userauth_pubkey_file(&host.user, None, key, None) {
                Ok(()) => {
                    debug!(host = %host.summary(), key = %key.display(), "using private key file");
                    return true;
                }
                Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_FILE) => {
                    if self.try_encrypted_key(session, host, key) {
                        return true;
                    }
                }
                Err(e) => {
                    debug!(host = %host.summary(), key = %key.display(), "key rejected: {}", e);
                }
            }
        }
        false
    }

    fn try_encrypted_key(&self, session: &Session, host: &Host, key: &Path) -> bool {
        let prompt = format!(
            "[{}] Enter Identity Passphrase ({}): ",
            host.summary(),
            key.display()
        );
        let Some(passphrase) = self.prompter.password(&prompt) else {
            return false;
        };

        match session.userauth_pubkey_file(&host.user, None, key, Some(&passphrase)) {
            Ok(()) => true,
            Err(e) => {
                warn!("private key file {} with passphrase failed: {}", key.display(), e);
                false
            }
        }
    }

    fn try_password(&self, session: &Session, host: &Host) -> bool {
        let prompt = format!("[{}] Enter Password: ", host.summary());
        let Some(password) = self.prompter.password(&prompt) else {
            return false;
        };
        match session.userauth_password(&host.user, &password) {
            Ok(()) => true,
            Err(e) => {
                debug!(host = %host.summary(), "password rejected: {}", e);
                false
            }
        }
    }

    fn try_keyboard_interactive(&self, session: &Session, host: &Host) -> bool {
        let mut challenge = Challenge {
            prompter: self.prompter.as_ref(),
        };
        for attempt in 1..=KEYBOARD_INTERACTIVE_ATTEMPTS {
            match session.userauth_keyboard_interactive(&host.user, &mut challenge) {
                Ok(()) => return true,
                Err(e) => {
                    debug!(host = %host.summary(), attempt, "keyboard-interactive failed: {}", e);
                }
            }
        }
        false
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new(Arc::new(TerminalPrompter))
    }
}

/// Bridges libssh2 challenges to a [`Prompter`]
struct Challenge<'p> {
    prompter: &'p dyn Prompter,
}

impl KeyboardInteractivePrompt for Challenge<'_> {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        instructions: &str,
        prompts: &[Prompt<'a>],
    ) -> Vec<String> {
        if !instructions.is_empty() {
            eprintln!("{}", instructions);
        }
        prompts
            .iter()
            .map(|p| self.prompter.answer(&p.text, p.echo).unwrap_or_default())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    struct Canned(&'static str);

    impl Prompter for Canned {
        fn password(&self, _prompt: &str) -> Option<String> {
            Some(self.0.to_string())
        }

        fn answer(&self, prompt: &str, echo: bool) -> Option<String> {
            Some(format!("{}:{}:{}", self.0, prompt, echo))
        }
    }

    #[test]
    fn test_secret_keeps_surrounding_spaces() {
        assert_eq!(secret(Ok("  pass phrase ".to_string())).as_deref(), Some("  pass phrase "));
        assert_eq!(
            secret(Err(std::io::Error::new(std::io::ErrorKind::Other, "no tty"))),
            None
        );
    }

    #[test]
    fn test_challenge_answers_every_prompt() {
        let canned = Canned("otp");
        let mut challenge = Challenge { prompter: &canned };
        let prompts = [
            Prompt {
                text: Cow::Borrowed("Password: "),
                echo: false,
            },
            Prompt {
                text: Cow::Borrowed("Code: "),
                echo: true,
            },
        ];

        let answers = challenge.prompt("ops", "", &prompts);
        assert_eq!(answers, vec!["otp:Password: :false", "otp:Code: :true"]);
    }
}
