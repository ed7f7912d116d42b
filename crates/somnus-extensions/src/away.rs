//! Away integration: participants an idle detector reports as away are
//! exempted and left out of the count until they come back.

use somnus_core::extension::{Extension, ExtensionContext, ExtensionError, ExtensionFactory};
use somnus_core::state::SleepEvent;
use somnus_types::{ExemptReason, Participant};
use tracing::debug;

/// Config section that enables the extension.
pub const SECTION: &str = "away";

/// Per-partition away integration.
#[derive(Debug, Default)]
pub struct Away;

impl Away {
    fn mark(ctx: &mut ExtensionContext<'_>, participant: &Participant) {
        if ctx
            .state
            .set_exempt(ctx.host.world_mut(), participant.id, true, ExemptReason::Away)
        {
            debug!(
                partition = %ctx.state.partition().name,
                participant = %participant.name,
                "Away participant exempted"
            );
        }
    }

    fn unmark(ctx: &mut ExtensionContext<'_>, participant: &Participant) {
        if ctx
            .state
            .release(ctx.host.world_mut(), participant.id, ExemptReason::Away)
        {
            debug!(
                partition = %ctx.state.partition().name,
                participant = %participant.name,
                "Participant back from away"
            );
        }
    }
}

impl Extension for Away {
    fn load(&mut self, ctx: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        for participant in ctx.host.participants(ctx.state.id()) {
            if ctx.host.is_away(participant.id) {
                Self::mark(ctx, &participant);
            }
        }
        Ok(())
    }

    fn observe(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        event: &SleepEvent,
    ) -> Result<(), ExtensionError> {
        match event {
            SleepEvent::AwayChanged {
                participant,
                away: true,
            } => Self::mark(ctx, participant),
            SleepEvent::AwayChanged {
                participant,
                away: false,
            } => Self::unmark(ctx, participant),
            SleepEvent::Joined(participant) | SleepEvent::RestExited(participant) => {
                if ctx.host.is_away(participant.id) {
                    Self::mark(ctx, participant);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn unload(&mut self, ctx: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        for participant in ctx.host.participants(ctx.state.id()) {
            Self::unmark(ctx, &participant);
        }
        Ok(())
    }
}

/// Factory for the `away` section.
pub fn factory() -> ExtensionFactory {
    Box::new(|_setup| Ok(Box::new(Away) as Box<dyn Extension>))
}
