use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Context, Result};
use dialoguer::Password;
use thiserror::Error;

pub mod plan;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Prompt interaction failed.")]
    PromptInteractionFailed(
        #[from]
        #[source]
        dialoguer::Error,
    ),
    #[error("Required user input `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Plan has {0} validation error(s).")]
    InvalidPlan(usize),
    #[error("Host `{0}` is not in the hosts file.")]
    UnknownHost(String),
    #[error("Plan failed on {0} of {1} host(s).")]
    HostsFailed(usize, usize),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("No subcommand provided.")]
    NoSubcommandProvided,
}

pub struct CliContext<'a> {
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(matches: &'a ArgMatches) -> Self {
        Self { matches }
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext) -> Result<()>;
}

pub trait Interactive<'a> {
    /// Prompt without echoing. An empty answer is a valid password.
    fn prompt_for_password(&self, message: &str) -> Result<String> {
        Password::new()
            .with_prompt(message)
            .allow_empty_password(true)
            .interact()
            .map_err(CommandErrors::PromptInteractionFailed)
            .context("Prompting for password failed.")
    }

    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    /// Read a path argument that has to point at an existing file.
    fn read_existing_file_argument(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Result<String> {
        self.read_argument_with_validator(arg_matches, id, &mut |input| {
            if std::path::Path::new(input).is_file() {
                Ok(())
            } else {
                Err(CommandErrors::InputValidationFailure(
                    id.into(),
                    "file exists".into(),
                ))
            }
        })
    }
}
