//! Per-instruction resolution: parse, validate/commit (re-parsing on a closer crop when
//! the action is rejected), then localize the committed object in the original frame.

use serde::Serialize;
use std::path::Path;
use tracing::{info, info_span, warn};

use crate::detection::{CropArtifact, Detector, ObjectLocalizer};
use crate::error::{GuideError, Result};
use crate::geometry::Point;
use crate::parser::{ImageDetail, InstructionParser, VisionLanguageModel};
use crate::session::SessionContext;
use crate::store::{CommitOutcome, EntryBackend, InstructionStore};

/// What the AR client receives for one instruction. `center` is `None` when the
/// committed object could not be found in the image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub ordinal: usize,
    pub object: String,
    pub action: String,
    pub center: Option<Point>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub crop: f64,
    pub final_pass: f64,
}

pub struct Resolver<M, D> {
    parser: InstructionParser<M>,
    localizer: ObjectLocalizer<D>,
    thresholds: Thresholds,
    crop_rounds: u32,
}

impl<M: VisionLanguageModel, D: Detector> Resolver<M, D> {
    pub fn new(
        parser: InstructionParser<M>,
        localizer: ObjectLocalizer<D>,
        thresholds: Thresholds,
        crop_rounds: u32,
    ) -> Self {
        Self {
            parser,
            localizer,
            thresholds,
            crop_rounds: crop_rounds.max(1),
        }
    }

    /// Resolves instruction `ordinal` against `image`.
    ///
    /// Errors: `ParseFailure` when the parser never yields usable JSON within its
    /// attempt budget, `InvalidAction` when every round proposed an action outside the
    /// vocabulary. Crops made along the way are deleted before returning.
    pub fn resolve<B: EntryBackend>(
        &self,
        store: &mut InstructionStore<B>,
        session: &SessionContext,
        ordinal: usize,
        image: &Path,
    ) -> Result<Resolution> {
        let instruction = session.require_instruction(ordinal)?;
        let span = info_span!("resolve", ordinal);
        let _guard = span.enter();
        info!(instruction, image = %image.display(), "resolving instruction");

        let (object, action) = self.parse_and_commit(store, session, ordinal, instruction, image)?;

        let center = self
            .localizer
            .localize_with_crop(
                image,
                &object,
                self.thresholds.crop,
                self.thresholds.final_pass,
            )?
            .map(|loc| loc.center());
        match center {
            Some(p) => info!(%object, %action, x = p.x, y = p.y, "instruction resolved"),
            None => warn!(%object, %action, "committed object not visible in image"),
        }

        Ok(Resolution {
            ordinal,
            object,
            action,
            center,
        })
    }

    fn parse_and_commit<B: EntryBackend>(
        &self,
        store: &mut InstructionStore<B>,
        session: &SessionContext,
        ordinal: usize,
        instruction: &str,
        image: &Path,
    ) -> Result<(String, String)> {
        let mut crop: Option<CropArtifact> = None;
        let mut detail = ImageDetail::Low;
        let mut last_token = String::new();

        for round in 1..=self.crop_rounds {
            let parse_image = crop.as_ref().map_or(image, CropArtifact::path);
            let history = store.history(session, ordinal);
            let parsed = self
                .parser
                .parse_with_retry(instruction, parse_image, &history, detail)?;

            match store.commit(&parsed, ordinal, session)? {
                CommitOutcome::Accepted { object, action } => {
                    info!(round, %object, %action, "committed");
                    return Ok((object, action));
                }
                CommitOutcome::Rejected { token } => {
                    warn!(round, %token, "parser proposed an unknown action");
                    last_token = token;
                }
            }

            if round == self.crop_rounds {
                break;
            }
            // Closer look for the next round: crop the original frame around the first
            // object's candidates and ask again at high detail.
            detail = ImageDetail::High;
            crop = self.localizer.crop_for_reparse(
                image,
                parsed.first_object(),
                self.thresholds.crop,
            )?;
            if let Some(c) = &crop {
                info!(round, crop = %c.path().display(), "re-parsing on cropped image");
            }
        }

        Err(GuideError::InvalidAction {
            rounds: self.crop_rounds,
            token: last_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionVocabulary;
    use crate::detection::tests::{pixel_box, write_frame, ScriptedDetector};
    use crate::parser::tests::ScriptedModel;
    use crate::store::MemoryBackend;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    const THRESHOLDS: Thresholds = Thresholds {
        crop: 0.3,
        final_pass: 0.5,
    };

    struct Fixture {
        dir: TempDir,
        frame: PathBuf,
        session: SessionContext,
        store: InstructionStore<MemoryBackend>,
    }

    impl Fixture {
        fn new(update_mode: bool) -> Self {
            let dir = tempdir().unwrap();
            let frame = dir.path().join("frame.png");
            write_frame(&frame, 200, 100);
            let session = SessionContext::new(
                vec![
                    "Pick up the red cup".to_string(),
                    "Press the blue switch".to_string(),
                ],
                update_mode,
            )
            .unwrap();
            let store =
                InstructionStore::open(MemoryBackend::default(), ActionVocabulary::default())
                    .unwrap();
            Self {
                dir,
                frame,
                session,
                store,
            }
        }

        fn crops(&self) -> PathBuf {
            self.dir.path().join("crops")
        }

        fn resolver<'a>(
            &self,
            model: &'a ScriptedModel,
            detector: &'a ScriptedDetector,
        ) -> Resolver<&'a ScriptedModel, &'a ScriptedDetector> {
            Resolver::new(
                InstructionParser::new(model, ActionVocabulary::default(), 3),
                ObjectLocalizer::new(detector, self.crops(), None),
                THRESHOLDS,
                3,
            )
        }

        fn crop_count(&self) -> usize {
            fs::read_dir(self.crops()).map(|d| d.count()).unwrap_or(0)
        }
    }

    fn reply(object: &str, action: &str) -> String {
        format!("JSON:\n{{\"objects\": [\"{object}\"], \"actions\": [\"{action}\"]}}")
    }

    #[test]
    fn resolves_and_remaps_center() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([reply("top blue switch", "press")]);
        let detector = ScriptedDetector::new(vec![
            vec![pixel_box(60.0, 40.0, 20.0, 20.0, 0.6, "blue switch")],
            vec![pixel_box(10.0, 10.0, 8.0, 8.0, 0.7, "blue switch")],
        ]);
        let resolver = fx.resolver(&model, &detector);
        let out = resolver
            .resolve(&mut fx.store, &fx.session, 1, &fx.frame)
            .unwrap();
        assert_eq!(
            out,
            Resolution {
                ordinal: 1,
                object: "top blue switch".to_string(),
                action: "press".to_string(),
                center: Some(Point::new(60.0, 40.0)),
            }
        );
        assert_eq!(detector.calls.borrow()[0].1, "top blue switch");
        assert_eq!(fx.store.entry(1).unwrap().first_action(), "press");
        assert_eq!(fx.crop_count(), 0);
        assert_eq!(model.requests.borrow()[0].detail, ImageDetail::Low);
    }

    #[test]
    fn null_center_when_nothing_detected() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([reply("red cup", "pick-up")]);
        let detector = ScriptedDetector::new(vec![vec![]]);
        let resolver = fx.resolver(&model, &detector);
        let out = resolver
            .resolve(&mut fx.store, &fx.session, 0, &fx.frame)
            .unwrap();
        assert_eq!(out.center, None);
        assert_eq!(out.action, "pick-up");
    }

    #[test]
    fn rejected_action_triggers_crop_and_high_detail_reparse() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([
            reply("blue switch", "flick"),
            reply("left blue switch", "press"),
        ]);
        let detector = ScriptedDetector::new(vec![
            vec![
                pixel_box(40.0, 40.0, 20.0, 20.0, 0.5, "blue switch"),
                pixel_box(120.0, 60.0, 20.0, 20.0, 0.5, "blue switch"),
            ],
            vec![pixel_box(40.0, 40.0, 20.0, 20.0, 0.6, "blue switch")],
            vec![pixel_box(12.0, 8.0, 6.0, 6.0, 0.8, "blue switch")],
        ]);
        let resolver = fx.resolver(&model, &detector);
        let out = resolver
            .resolve(&mut fx.store, &fx.session, 1, &fx.frame)
            .unwrap();
        assert_eq!(out.action, "press");
        assert_eq!(out.center, Some(Point::new(42.0, 38.0)));

        let requests = model.requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].detail, ImageDetail::High);
        assert_ne!(requests[1].image, fx.frame);
        let calls = detector.calls.borrow();
        assert_eq!(calls[0].1, "blue switch");
        assert_eq!(calls[0].2, THRESHOLDS.crop);
        assert_eq!(fx.crop_count(), 0);
    }

    #[test]
    fn single_box_skips_crop_but_raises_detail() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([reply("switch", "flick"), reply("switch", "press")]);
        let detector = ScriptedDetector::new(vec![
            vec![pixel_box(40.0, 40.0, 20.0, 20.0, 0.5, "switch")],
            vec![],
        ]);
        let resolver = fx.resolver(&model, &detector);
        let out = resolver
            .resolve(&mut fx.store, &fx.session, 1, &fx.frame)
            .unwrap();
        assert_eq!(out.center, None);
        let requests = model.requests.borrow();
        assert_eq!(requests[1].image, fx.frame);
        assert_eq!(requests[1].detail, ImageDetail::High);
    }

    #[test]
    fn exhausted_rounds_fail_without_committing() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([
            reply("switch", "flick"),
            reply("switch", "flip"),
            reply("switch", "smash"),
        ]);
        let detector = ScriptedDetector::new(vec![
            vec![
                pixel_box(40.0, 40.0, 20.0, 20.0, 0.5, "switch"),
                pixel_box(120.0, 60.0, 20.0, 20.0, 0.5, "switch"),
            ],
            vec![
                pixel_box(40.0, 40.0, 20.0, 20.0, 0.5, "switch"),
                pixel_box(120.0, 60.0, 20.0, 20.0, 0.5, "switch"),
            ],
        ]);
        let resolver = fx.resolver(&model, &detector);
        let err = resolver
            .resolve(&mut fx.store, &fx.session, 1, &fx.frame)
            .unwrap_err();
        match err {
            GuideError::InvalidAction { rounds, token } => {
                assert_eq!(rounds, 3);
                assert_eq!(token, "smash");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.store.entry(1).is_none());
        assert_eq!(fx.store.backend().persist_count(), 0);
        assert_eq!(detector.calls.borrow().len(), 2);
        assert_eq!(fx.crop_count(), 0);
    }

    #[test]
    fn parse_failure_cleans_up_crop() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([reply("switch", "flick"), "?".into(), "?".into(), "?".into()]);
        let detector = ScriptedDetector::new(vec![vec![
            pixel_box(40.0, 40.0, 20.0, 20.0, 0.5, "switch"),
            pixel_box(120.0, 60.0, 20.0, 20.0, 0.5, "switch"),
        ]]);
        let resolver = fx.resolver(&model, &detector);
        let err = resolver
            .resolve(&mut fx.store, &fx.session, 1, &fx.frame)
            .unwrap_err();
        assert!(matches!(err, GuideError::ParseFailure { attempts: 3, .. }));
        assert_eq!(fx.crop_count(), 0);
    }

    #[test]
    fn history_of_earlier_steps_reaches_parser() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([reply("red cup", "pick-up"), reply("blue switch", "press")]);
        let detector = ScriptedDetector::new(vec![]);
        let resolver = fx.resolver(&model, &detector);
        resolver
            .resolve(&mut fx.store, &fx.session, 0, &fx.frame)
            .unwrap();
        resolver
            .resolve(&mut fx.store, &fx.session, 1, &fx.frame)
            .unwrap();
        let requests = model.requests.borrow();
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[1].history.len(), 1);
        assert_eq!(requests[1].history[0].instruction, "Pick up the red cup");
        assert_eq!(requests[1].history[0].result.first_action(), "pick-up");
    }

    #[test]
    fn repeated_pickup_resolves_to_place() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new([reply("red cup", "pick-up"), reply("red cup", "pick-up")]);
        let detector = ScriptedDetector::new(vec![]);
        let resolver = fx.resolver(&model, &detector);
        let first = resolver
            .resolve(&mut fx.store, &fx.session, 0, &fx.frame)
            .unwrap();
        let second = resolver
            .resolve(&mut fx.store, &fx.session, 0, &fx.frame)
            .unwrap();
        assert_eq!(first.action, "pick-up");
        assert_eq!(second.action, "place");
    }

    #[test]
    fn unknown_ordinal_is_rejected_up_front() {
        let mut fx = Fixture::new(false);
        let model = ScriptedModel::new(Vec::<String>::new());
        let detector = ScriptedDetector::new(vec![]);
        let resolver = fx.resolver(&model, &detector);
        assert!(matches!(
            resolver.resolve(&mut fx.store, &fx.session, 7, &fx.frame),
            Err(GuideError::UnknownOrdinal { ordinal: 7, count: 2 })
        ));
        assert!(model.requests.borrow().is_empty());
    }

    #[test]
    fn blank_instruction_line_never_reaches_parser() {
        let mut fx = Fixture::new(false);
        fx.session = SessionContext::new(
            vec!["Press the blue switch".to_string(), "   ".to_string()],
            false,
        )
        .unwrap();
        let model = ScriptedModel::new([reply("blue switch", "press")]);
        let detector = ScriptedDetector::new(vec![]);
        let resolver = fx.resolver(&model, &detector);
        assert!(matches!(
            resolver.resolve(&mut fx.store, &fx.session, 1, &fx.frame),
            Err(GuideError::Configuration(_))
        ));
        assert!(model.requests.borrow().is_empty());
        assert!(fx.store.entry(1).is_none());
    }
}
