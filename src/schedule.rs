use crate::error::ScheduleError;

/// An instruction for one pipeline stage at one time step. Every variant
/// carries `(stage_id, micro_batch_id, step_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeInstruction {
    OptimizerStep {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    ReduceGrads {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    ForwardPass {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    BackwardPass {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    SendActivation {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    RecvActivation {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    SendGrad {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    RecvGrad {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    SendNextTokens {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    RecvNextTokens {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
    /// No-op sentinel closing a schedule stream.
    EndSchedule {
        stage_id: usize,
        micro_batch_id: usize,
        step_id: usize,
    },
}

impl PipeInstruction {
    pub fn name(&self) -> &'static str {
        match self {
            PipeInstruction::OptimizerStep { .. } => "OptimizerStep",
            PipeInstruction::ReduceGrads { .. } => "ReduceGrads",
            PipeInstruction::ForwardPass { .. } => "ForwardPass",
            PipeInstruction::BackwardPass { .. } => "BackwardPass",
            PipeInstruction::SendActivation { .. } => "SendActivation",
            PipeInstruction::RecvActivation { .. } => "RecvActivation",
            PipeInstruction::SendGrad { .. } => "SendGrad",
            PipeInstruction::RecvGrad { .. } => "RecvGrad",
            PipeInstruction::SendNextTokens { .. } => "SendNextTokens",
            PipeInstruction::RecvNextTokens { .. } => "RecvNextTokens",
            PipeInstruction::EndSchedule { .. } => "EndSchedule",
        }
    }

    pub fn micro_batch_id(&self) -> usize {
        match *self {
            PipeInstruction::OptimizerStep { micro_batch_id, .. }
            | PipeInstruction::ReduceGrads { micro_batch_id, .. }
            | PipeInstruction::ForwardPass { micro_batch_id, .. }
            | PipeInstruction::BackwardPass { micro_batch_id, .. }
            | PipeInstruction::SendActivation { micro_batch_id, .. }
            | PipeInstruction::RecvActivation { micro_batch_id, .. }
            | PipeInstruction::SendGrad { micro_batch_id, .. }
            | PipeInstruction::RecvGrad { micro_batch_id, .. }
            | PipeInstruction::SendNextTokens { micro_batch_id, .. }
            | PipeInstruction::RecvNextTokens { micro_batch_id, .. }
            | PipeInstruction::EndSchedule { micro_batch_id, .. } => micro_batch_id,
        }
    }

    pub fn step_id(&self) -> usize {
        match *self {
            PipeInstruction::OptimizerStep { step_id, .. }
            | PipeInstruction::ReduceGrads { step_id, .. }
            | PipeInstruction::ForwardPass { step_id, .. }
            | PipeInstruction::BackwardPass { step_id, .. }
            | PipeInstruction::SendActivation { step_id, .. }
            | PipeInstruction::RecvActivation { step_id, .. }
            | PipeInstruction::SendGrad { step_id, .. }
            | PipeInstruction::RecvGrad { step_id, .. }
            | PipeInstruction::SendNextTokens { step_id, .. }
            | PipeInstruction::RecvNextTokens { step_id, .. }
            | PipeInstruction::EndSchedule { step_id, .. } => step_id,
        }
    }
}

/// The work of one time step on one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCmds {
    pub step_id: usize,
    pub micro_batch: Option<usize>,
    pub cmds: Vec<PipeInstruction>,
}

/// A schedule is a lazy finite sequence of per-step instruction lists,
/// parameterised by `(micro_batches, stages, stage_id)`.
pub trait PipeSchedule: Iterator<Item = StepCmds> {
    fn num_micro_batches(&self) -> usize;
    fn num_stages(&self) -> usize;
    fn stage_id(&self) -> usize;

    fn is_first_stage(&self) -> bool {
        self.stage_id() == 0
    }

    fn is_last_stage(&self) -> bool {
        self.stage_id() == self.num_stages() - 1
    }
}

fn validate(
    micro_batches: usize,
    stages: usize,
    stage_id: usize,
) -> Result<(), ScheduleError> {
    if stages == 0 {
        return Err(ScheduleError::ZeroStages);
    }
    if micro_batches == 0 {
        return Err(ScheduleError::ZeroMicroBatches);
    }
    if stage_id >= stages {
        return Err(ScheduleError::StageOutOfRange {
            stage_id,
            num_stages: stages,
        });
    }
    Ok(())
}

/// Forward-only fill-drain schedule. With `p` stages and `m` micro-batches a
/// stage sees `m + p - 1` time steps; stage `s` processes micro-batch
/// `k - s` at step `k`. The first stage never receives, the last never sends.
#[derive(Debug, Clone)]
pub struct InferenceSchedule {
    micro_batches: usize,
    stages: usize,
    stage_id: usize,
    step: usize,
    total_steps: usize,
}

impl InferenceSchedule {
    pub fn new(
        micro_batches: usize,
        stages: usize,
        stage_id: usize,
    ) -> Result<Self, ScheduleError> {
        validate(micro_batches, stages, stage_id)?;
        Ok(Self {
            micro_batches,
            stages,
            stage_id,
            step: 0,
            total_steps: micro_batches + stages - 1,
        })
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

impl Iterator for InferenceSchedule {
    type Item = StepCmds;

    fn next(&mut self) -> Option<StepCmds> {
        if self.step >= self.total_steps {
            return None;
        }
        let k = self.step;
        self.step += 1;

        let s = self.stage_id;
        let mb = k as i64 - s as i64;
        let mut cmds = Vec::new();
        let micro_batch = if mb >= 0 && (mb as usize) < self.micro_batches {
            let mb = mb as usize;
            if s > 0 {
                cmds.push(PipeInstruction::RecvActivation {
                    stage_id: s,
                    micro_batch_id: mb,
                    step_id: k,
                });
            }
            cmds.push(PipeInstruction::ForwardPass {
                stage_id: s,
                micro_batch_id: mb,
                step_id: k,
            });
            if s < self.stages - 1 {
                cmds.push(PipeInstruction::SendActivation {
                    stage_id: s,
                    micro_batch_id: mb,
                    step_id: k,
                });
            }
            Some(mb)
        } else {
            None
        };

        Some(StepCmds {
            step_id: k,
            micro_batch,
            cmds,
        })
    }
}

impl PipeSchedule for InferenceSchedule {
    fn num_micro_batches(&self) -> usize {
        self.micro_batches
    }
    fn num_stages(&self) -> usize {
        self.stages
    }
    fn stage_id(&self) -> usize {
        self.stage_id
    }
}

/// 1F1B training schedule. After a warm-up of `stages - stage_id - 1`
/// forwards, each stage alternates one backward for the oldest in-flight
/// micro-batch with one forward for the next; cool-down backwards drain the
/// rest. On any step where both would be eligible, backward wins, which keeps
/// at most `stages - stage_id` activations alive per stage. The final step
/// appends ReduceGrads and OptimizerStep.
#[derive(Debug, Clone)]
pub struct TrainSchedule {
    micro_batches: usize,
    stages: usize,
    stage_id: usize,
    step: usize,
    total_steps: usize,
}

impl TrainSchedule {
    pub fn new(
        micro_batches: usize,
        stages: usize,
        stage_id: usize,
    ) -> Result<Self, ScheduleError> {
        validate(micro_batches, stages, stage_id)?;
        Ok(Self {
            micro_batches,
            stages,
            stage_id,
            step: 0,
            total_steps: 2 * (micro_batches + stages - 1),
        })
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Even/odd interleaving: even stages run forwards on even steps and
    /// backwards on odd steps; odd stages do the opposite.
    fn step_to_micro_batch(&self, step: usize) -> (i64, bool) {
        let s = self.stage_id as i64;
        let p = self.stages as i64;
        let k = step as i64;
        let even_step = k % 2 == 0;
        let even_stage = s % 2 == 0;
        match (even_step, even_stage) {
            (true, true) => (k / 2 - s / 2, true),
            (false, false) => ((k - 1) / 2 - s / 2, true),
            (true, false) => (k / 2 - p + (s + 1) / 2, false),
            (false, true) => ((k - 1) / 2 - p + 1 + s / 2, false),
        }
    }
}

impl Iterator for TrainSchedule {
    type Item = StepCmds;

    fn next(&mut self) -> Option<StepCmds> {
        if self.step >= self.total_steps {
            return None;
        }
        let k = self.step;
        self.step += 1;

        let s = self.stage_id;
        let (mb, is_forward) = self.step_to_micro_batch(k);
        let mut cmds = Vec::new();
        let micro_batch = if mb >= 0 && (mb as usize) < self.micro_batches {
            let mb = mb as usize;
            if is_forward {
                if s > 0 {
                    cmds.push(PipeInstruction::RecvActivation {
                        stage_id: s,
                        micro_batch_id: mb,
                        step_id: k,
                    });
                }
                cmds.push(PipeInstruction::ForwardPass {
                    stage_id: s,
                    micro_batch_id: mb,
                    step_id: k,
                });
                if s < self.stages - 1 {
                    cmds.push(PipeInstruction::SendActivation {
                        stage_id: s,
                        micro_batch_id: mb,
                        step_id: k,
                    });
                }
            } else {
                if s < self.stages - 1 {
                    cmds.push(PipeInstruction::RecvGrad {
                        stage_id: s,
                        micro_batch_id: mb,
                        step_id: k,
                    });
                }
                cmds.push(PipeInstruction::BackwardPass {
                    stage_id: s,
                    micro_batch_id: mb,
                    step_id: k,
                });
                if s > 0 {
                    cmds.push(PipeInstruction::SendGrad {
                        stage_id: s,
                        micro_batch_id: mb,
                        step_id: k,
                    });
                }
            }
            Some(mb)
        } else {
            None
        };

        if k == self.total_steps - 1 {
            cmds.push(PipeInstruction::ReduceGrads {
                stage_id: s,
                micro_batch_id: 0,
                step_id: k,
            });
            cmds.push(PipeInstruction::OptimizerStep {
                stage_id: s,
                micro_batch_id: 0,
                step_id: k,
            });
        }

        Some(StepCmds {
            step_id: k,
            micro_batch,
            cmds,
        })
    }
}

impl PipeSchedule for TrainSchedule {
    fn num_micro_batches(&self) -> usize {
        self.micro_batches
    }
    fn num_stages(&self) -> usize {
        self.stages
    }
    fn stage_id(&self) -> usize {
        self.stage_id
    }
}

/// Token-parallel generation schedule. Micro-batches circulate around the
/// pipeline ring: stage `s` handles token `t` of micro-batch `m` at step
/// `t*V + m + s` with period `V = micro_batches + stages - 1`. The period
/// leaves every stage `stages - 1` idle steps per token round, which is what
/// the engine's burn-out counts rely on when termination cuts the run short.
/// The last stage sends sampled tokens back to stage 0, which feeds them into
/// the next forward. `max_new_tokens` arrives pre-inflated by `stages - 1`
/// for termination draining.
#[derive(Debug, Clone)]
pub struct GenerateSchedule {
    micro_batches: usize,
    stages: usize,
    stage_id: usize,
    max_new_tokens: usize,
    step: usize,
    total_steps: usize,
}

impl GenerateSchedule {
    pub fn new(
        micro_batches: usize,
        stages: usize,
        stage_id: usize,
        max_new_tokens: usize,
    ) -> Result<Self, ScheduleError> {
        validate(micro_batches, stages, stage_id)?;
        if max_new_tokens == 0 {
            return Err(ScheduleError::ZeroNewTokens);
        }
        let v = micro_batches + stages - 1;
        // last productive step for this stage, then one EndSchedule step
        let total_steps = (max_new_tokens - 1) * v + micro_batches + stage_id + 1;
        Ok(Self {
            micro_batches,
            stages,
            stage_id,
            max_new_tokens,
            step: 0,
            total_steps,
        })
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    fn ring_period(&self) -> usize {
        self.micro_batches + self.stages - 1
    }
}

impl Iterator for GenerateSchedule {
    type Item = StepCmds;

    fn next(&mut self) -> Option<StepCmds> {
        if self.step >= self.total_steps {
            return None;
        }
        let k = self.step;
        self.step += 1;

        let s = self.stage_id;
        let v = self.ring_period();
        let mut cmds = Vec::new();

        if k == self.total_steps - 1 {
            cmds.push(PipeInstruction::EndSchedule {
                stage_id: s,
                micro_batch_id: 0,
                step_id: k,
            });
            return Some(StepCmds {
                step_id: k,
                micro_batch: None,
                cmds,
            });
        }

        let micro_batch = if k >= s {
            let offset = k - s;
            let (t, m) = (offset / v, offset % v);
            if m < self.micro_batches && t < self.max_new_tokens {
                if s == 0 {
                    if t > 0 {
                        cmds.push(PipeInstruction::RecvNextTokens {
                            stage_id: s,
                            micro_batch_id: m,
                            step_id: k,
                        });
                    }
                    cmds.push(PipeInstruction::ForwardPass {
                        stage_id: s,
                        micro_batch_id: m,
                        step_id: k,
                    });
                    cmds.push(PipeInstruction::SendActivation {
                        stage_id: s,
                        micro_batch_id: m,
                        step_id: k,
                    });
                } else if s < self.stages - 1 {
                    cmds.push(PipeInstruction::RecvActivation {
                        stage_id: s,
                        micro_batch_id: m,
                        step_id: k,
                    });
                    cmds.push(PipeInstruction::ForwardPass {
                        stage_id: s,
                        micro_batch_id: m,
                        step_id: k,
                    });
                    cmds.push(PipeInstruction::SendActivation {
                        stage_id: s,
                        micro_batch_id: m,
                        step_id: k,
                    });
                } else {
                    cmds.push(PipeInstruction::RecvActivation {
                        stage_id: s,
                        micro_batch_id: m,
                        step_id: k,
                    });
                    cmds.push(PipeInstruction::ForwardPass {
                        stage_id: s,
                        micro_batch_id: m,
                        step_id: k,
                    });
                    if t + 1 < self.max_new_tokens {
                        cmds.push(PipeInstruction::SendNextTokens {
                            stage_id: s,
                            micro_batch_id: m,
                            step_id: k,
                        });
                    }
                }
                Some(m)
            } else {
                None
            }
        } else {
            None
        };

        Some(StepCmds {
            step_id: k,
            micro_batch,
            cmds,
        })
    }
}

impl PipeSchedule for GenerateSchedule {
    fn num_micro_batches(&self) -> usize {
        self.micro_batches
    }
    fn num_stages(&self) -> usize {
        self.stages
    }
    fn stage_id(&self) -> usize {
        self.stage_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn collect_all<S: PipeSchedule>(sched: S) -> Vec<StepCmds> {
        sched.collect()
    }

    fn count_of(steps: &[StepCmds], name: &str) -> usize {
        steps
            .iter()
            .flat_map(|s| &s.cmds)
            .filter(|c| c.name() == name)
            .count()
    }

    fn mbs_of(steps: &[StepCmds], name: &str) -> Vec<usize> {
        let mut v: Vec<usize> = steps
            .iter()
            .flat_map(|s| &s.cmds)
            .filter(|c| c.name() == name)
            .map(|c| c.micro_batch_id())
            .collect();
        v.sort();
        v
    }

    #[test]
    fn inference_totals_four_stages_four_mbs() {
        for s in 0..4 {
            let sched = InferenceSchedule::new(4, 4, s).unwrap();
            assert_eq!(sched.total_steps(), 7);
            let steps = collect_all(sched);
            assert_eq!(steps.len(), 7);
            assert_eq!(count_of(&steps, "ForwardPass"), 4);
            assert_eq!(
                count_of(&steps, "RecvActivation"),
                if s == 0 { 0 } else { 4 }
            );
            assert_eq!(
                count_of(&steps, "SendActivation"),
                if s == 3 { 0 } else { 4 }
            );
        }
    }

    #[test]
    fn inference_send_recv_pairing() {
        let p = 4;
        let m = 4;
        for s in 0..p - 1 {
            let sends = mbs_of(&collect_all(InferenceSchedule::new(m, p, s).unwrap()), "SendActivation");
            let recvs = mbs_of(
                &collect_all(InferenceSchedule::new(m, p, s + 1).unwrap()),
                "RecvActivation",
            );
            assert_eq!(sends, recvs, "stage {s} -> {}", s + 1);
        }
    }

    #[test]
    fn inference_first_stage_starts_immediately() {
        let steps = collect_all(InferenceSchedule::new(4, 4, 0).unwrap());
        assert_eq!(
            steps[0].cmds,
            vec![
                PipeInstruction::ForwardPass {
                    stage_id: 0,
                    micro_batch_id: 0,
                    step_id: 0
                },
                PipeInstruction::SendActivation {
                    stage_id: 0,
                    micro_batch_id: 0,
                    step_id: 0
                },
            ]
        );
        // drains with idle steps at the end
        assert!(steps[6].cmds.is_empty());
    }

    #[test]
    fn train_two_stages_two_mbs_exact_streams() {
        // stage 0: F0, F1, (RG0 BW0), (RG1 BW1 Reduce Step)
        let steps = collect_all(TrainSchedule::new(2, 2, 0).unwrap());
        let names: Vec<Vec<&str>> = steps
            .iter()
            .filter(|s| !s.cmds.is_empty())
            .map(|s| s.cmds.iter().map(|c| c.name()).collect())
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["ForwardPass", "SendActivation"],
                vec!["ForwardPass", "SendActivation"],
                vec!["RecvGrad", "BackwardPass"],
                vec!["RecvGrad", "BackwardPass", "ReduceGrads", "OptimizerStep"],
            ]
        );

        // stage 1: (RA0 F0), (BW0 SG0), (RA1 F1), (BW1 SG1), (Reduce Step)
        let steps = collect_all(TrainSchedule::new(2, 2, 1).unwrap());
        let names: Vec<Vec<&str>> = steps
            .iter()
            .filter(|s| !s.cmds.is_empty())
            .map(|s| s.cmds.iter().map(|c| c.name()).collect())
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["RecvActivation", "ForwardPass"],
                vec!["BackwardPass", "SendGrad"],
                vec!["RecvActivation", "ForwardPass"],
                vec!["BackwardPass", "SendGrad"],
                vec!["ReduceGrads", "OptimizerStep"],
            ]
        );
    }

    #[test]
    fn train_totals_per_stage() {
        for (p, m) in [(2usize, 2usize), (2, 4), (4, 8), (3, 6)] {
            for s in 0..p {
                let steps = collect_all(TrainSchedule::new(m, p, s).unwrap());
                assert_eq!(count_of(&steps, "ForwardPass"), m, "p={p} m={m} s={s}");
                assert_eq!(count_of(&steps, "BackwardPass"), m);
                assert_eq!(count_of(&steps, "ReduceGrads"), 1);
                assert_eq!(count_of(&steps, "OptimizerStep"), 1);
                assert_eq!(
                    count_of(&steps, "RecvGrad"),
                    if s == p - 1 { 0 } else { m }
                );
                assert_eq!(count_of(&steps, "SendGrad"), if s == 0 { 0 } else { m });
            }
        }
    }

    #[test]
    fn train_grad_pairing_reversed() {
        let (p, m) = (4usize, 8usize);
        for s in 0..p - 1 {
            let sends = mbs_of(&collect_all(TrainSchedule::new(m, p, s + 1).unwrap()), "SendGrad");
            let recvs = mbs_of(&collect_all(TrainSchedule::new(m, p, s).unwrap()), "RecvGrad");
            assert_eq!(sends, recvs, "grads {} -> {s}", s + 1);
        }
    }

    #[test]
    fn train_one_f_one_b_after_warmup() {
        // stage 0, 2 stages, 4 micro-batches: F F B F B F B B
        let steps = collect_all(TrainSchedule::new(4, 2, 0).unwrap());
        let seq: Vec<&str> = steps
            .iter()
            .flat_map(|s| &s.cmds)
            .filter(|c| matches!(
                c,
                PipeInstruction::ForwardPass { .. } | PipeInstruction::BackwardPass { .. }
            ))
            .map(|c| c.name())
            .collect();
        assert_eq!(
            seq,
            vec![
                "ForwardPass",
                "ForwardPass",
                "BackwardPass",
                "ForwardPass",
                "BackwardPass",
                "ForwardPass",
                "BackwardPass",
                "BackwardPass",
            ]
        );
    }

    #[test]
    fn train_backward_order_is_fifo() {
        let steps = collect_all(TrainSchedule::new(4, 2, 0).unwrap());
        let bw_mbs: Vec<usize> = steps
            .iter()
            .flat_map(|s| &s.cmds)
            .filter(|c| matches!(c, PipeInstruction::BackwardPass { .. }))
            .map(|c| c.micro_batch_id())
            .collect();
        assert_eq!(bw_mbs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn generate_forward_counts() {
        let (p, m, toks) = (4usize, 2usize, 6usize);
        for s in 0..p {
            let steps = collect_all(GenerateSchedule::new(m, p, s, toks).unwrap());
            assert_eq!(count_of(&steps, "ForwardPass"), m * toks, "stage {s}");
            assert_eq!(count_of(&steps, "EndSchedule"), 1);
            // EndSchedule is the very last step
            assert_eq!(
                steps.last().unwrap().cmds[0].name(),
                "EndSchedule"
            );
        }
    }

    #[test]
    fn generate_next_token_ring_pairing() {
        let (p, m, toks) = (4usize, 2usize, 6usize);
        let sends = mbs_of(
            &collect_all(GenerateSchedule::new(m, p, p - 1, toks).unwrap()),
            "SendNextTokens",
        );
        let recvs = mbs_of(
            &collect_all(GenerateSchedule::new(m, p, 0, toks).unwrap()),
            "RecvNextTokens",
        );
        assert_eq!(sends, recvs);
        // one send per (token, mb) except the last token
        assert_eq!(sends.len(), (toks - 1) * m);
    }

    #[test]
    fn generate_activation_pairing_all_links() {
        let (p, m, toks) = (3usize, 5usize, 4usize);
        for s in 0..p - 1 {
            let sends = mbs_of(
                &collect_all(GenerateSchedule::new(m, p, s, toks).unwrap()),
                "SendActivation",
            );
            let recvs = mbs_of(
                &collect_all(GenerateSchedule::new(m, p, s + 1, toks).unwrap()),
                "RecvActivation",
            );
            assert_eq!(sends, recvs, "stage {s} -> {}", s + 1);
        }
    }

    #[test]
    fn generate_first_token_has_no_token_recv() {
        let steps = collect_all(GenerateSchedule::new(2, 2, 0, 3).unwrap());
        let first_fwd_step = steps
            .iter()
            .find(|s| s.cmds.iter().any(|c| c.name() == "ForwardPass"))
            .unwrap();
        assert!(first_fwd_step
            .cmds
            .iter()
            .all(|c| c.name() != "RecvNextTokens"));
    }

    #[test]
    fn generate_stage_conflict_free() {
        // no stage is asked to run two forwards in one step
        for s in 0..4 {
            for step in collect_all(GenerateSchedule::new(8, 4, s, 5).unwrap()) {
                let fwd = step.cmds.iter().filter(|c| c.name() == "ForwardPass").count();
                assert!(fwd <= 1, "stage {s} step {}", step.step_id);
            }
        }
    }

    #[test]
    fn generate_token_order_per_micro_batch() {
        // forwards for a given mb must appear in token order, spaced by the
        // ring period m + p - 1
        let steps = collect_all(GenerateSchedule::new(2, 4, 0, 4).unwrap());
        let mut per_mb: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for s in &steps {
            for c in &s.cmds {
                if c.name() == "ForwardPass" {
                    per_mb.entry(c.micro_batch_id()).or_default().push(s.step_id);
                }
            }
        }
        for (_, v) in per_mb {
            assert!(v.windows(2).all(|w| w[1] == w[0] + 5));
        }
    }

    #[test]
    fn generate_idle_gap_covers_burn_out() {
        // every stage has at least p - 1 consecutive idle steps per token
        // round, so the engine's burn-out tail never meets live work
        let (p, m, toks) = (4usize, 6usize, 3usize);
        for s in 0..p {
            let steps = collect_all(GenerateSchedule::new(m, p, s, toks).unwrap());
            let busy: Vec<bool> = steps.iter().map(|st| !st.cmds.is_empty()).collect();
            // count the idle run right after each busy run
            let mut i = 0;
            while i < busy.len() {
                if busy[i] {
                    let mut j = i;
                    while j < busy.len() && busy[j] {
                        j += 1;
                    }
                    let mut k = j;
                    while k < busy.len() && !busy[k] {
                        k += 1;
                    }
                    if k < busy.len() {
                        assert!(k - j >= p - 1, "stage {s}: idle gap {} at {j}", k - j);
                    }
                    i = k;
                } else {
                    i += 1;
                }
            }
        }
    }

    #[test]
    fn zero_parameters_rejected() {
        assert!(matches!(
            InferenceSchedule::new(0, 2, 0),
            Err(ScheduleError::ZeroMicroBatches)
        ));
        assert!(matches!(
            TrainSchedule::new(2, 0, 0),
            Err(ScheduleError::ZeroStages)
        ));
        assert!(matches!(
            GenerateSchedule::new(2, 2, 0, 0),
            Err(ScheduleError::ZeroNewTokens)
        ));
        assert!(matches!(
            InferenceSchedule::new(2, 2, 5),
            Err(ScheduleError::StageOutOfRange { .. })
        ));
    }
}
