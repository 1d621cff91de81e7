#![cfg(test)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::big_segments::{BigSegmentMembership, BigSegmentMembershipResult, BigSegmentsStatus};
use crate::contexts::Context;
use crate::eval::{Detail, EventFactory};
use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::segment::Segment;
use crate::store::Store;

pub struct TestStore {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
    big_segments: Option<(BigSegmentsStatus, HashMap<String, BigSegmentMembership>)>,
    big_segment_queries: AtomicUsize,
}

impl TestStore {
    pub fn new() -> Self {
        let flags = r#"{
            "flag": {
                "key": "flag",
                "on": false,
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithRuleExclusion": {
                "key": "flag",
                "on": false,
                "rules": [
                    {
                        "variation": 0,
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [
                            {
                                "attribute": "platform",
                                "op": "in",
                                "values": ["web", "aem", "ios"]
                            }
                        ],
                        "trackEvents": true
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEventsFallthrough": true,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithMatchesOpOnGroups": {
                "key": "flagWithMatchesOpOnGroups",
                "on": true,
                "rules": [
                    {
                        "variation": 0,
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [
                            {
                                "attribute": "groups",
                                "op": "matches",
                                "values": ["^\\w+"]
                            }
                        ],
                        "trackEvents": true
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEventsFallthrough": true,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithMatchesOpOnKinds": {
                "key": "flagWithMatchesOpOnKinds",
                "on": true,
                "rules": [
                    {
                        "variation": 0,
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [
                            {
                                "attribute": "kind",
                                "op": "matches",
                                "values": [
                                    "^[ou]"
                                ]
                            }
                        ],
                        "trackEvents": true
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEventsFallthrough": true,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithMatchesOpOnKindsAttributeReference": {
                "key": "flagWithMatchesOpOnKindsAttributeReference",
                "on": true,
                "rules": [
                    {
                        "variation": 0,
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [
                            {
                                "attribute": "/kind",
                                "op": "matches",
                                "values": [
                                    "^[ou]"
                                ],
                                "contextKind": "arbitrary"
                            }
                        ],
                        "trackEvents": true
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEventsFallthrough": true,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithMatchesOpOnKindsPlainAttributeReference": {
                "key": "flagWithMatchesOpOnKindsPlainAttributeReference",
                "on": true,
                "rules": [
                    {
                        "variation": 0,
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [
                            {
                                "attribute": "kind",
                                "op": "matches",
                                "values": [
                                    "^[ou]"
                                ],
                                "contextKind": "arbitrary"
                            }
                        ],
                        "trackEvents": true
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEventsFallthrough": true,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithTrackAndDebugEvents": {
                "key": "flag",
                "on": false,
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEvents": true,
                "trackEventsFallthrough": true,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithExperiment": {
                "key": "flagWithExperiment",
                "on": true,
                "fallthrough": {
                    "rollout": {
                        "kind": "experiment",
                        "seed": 61,
                        "variations": [
                            {
                                "variation": 0,
                                "weight": 10000,
                                "untracked": false
                            },
                            {
                                "variation": 1,
                                "weight": 20000,
                                "untracked": false
                            },
                            {
                                "variation": 0,
                                "weight": 70000,
                                "untracked": true
                            }
                        ]
                    }
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEventsFallthrough": false,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithExperimentTargetingContext": {
                "key": "flagWithExperimentTargetingContext",
                "on": true,
                "fallthrough": {
                    "rollout": {
                        "kind": "experiment",
                        "contextKind": "org",
                        "seed": 61,
                        "variations": [
                            {
                                "variation": 0,
                                "weight": 10000,
                                "untracked": false
                            },
                            {
                                "variation": 1,
                                "weight": 20000,
                                "untracked": false
                            },
                            {
                                "variation": 0,
                                "weight": 70000,
                                "untracked": true
                            }
                        ]
                    }
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty",
                "trackEventsFallthrough": false,
                "debugEventsUntilDate": 1500000000
            },
            "flagWithRolloutBucketBy": {
                "key": "rollout",
                "on": true,
                "rules": [
                    {
                        "rollout": {
                            "variations": [
                                {
                                    "variation": 0,
                                    "weight": 50000
                                },
                                {
                                    "variation": 1,
                                    "weight": 50000
                                },
                                {
                                    "variation": 2,
                                    "weight": 0
                                }
                            ],
                            "bucketBy": "ld_quid"
                        },
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [
                            {
                                "attribute": "platform",
                                "op": "in",
                                "values": ["web", "aem", "ios"]
                            }
                        ]
                    }
                ],
                "fallthrough": {
                    "variation": 2
                },
                "offVariation": 1,
                "variations": ["rollout1", "rollout2", "rollout3"],
                "salt": "ce2634f116d741a7ad1b7ef363f6f9bc",
                "trackEventsFallthrough": false,
                "debugEventsUntilDate": null
            },
            "flagWithTarget": {
                "key": "flagWithTarget",
                "on": false,
                "targets": [
                    {
                        "values": ["bob"],
                        "variation": 0
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithContextTarget": {
                "key": "flagWithContextTarget",
                "on": true,
                "targets": [
                    {
                        "values": ["bob"],
                        "variation": 1
                    }
                ],
                "contextTargets": [
                    {
                        "contextKind": "org",
                        "values": ["Acme"],
                        "variation": 1
                    },
                    {
                        "contextKind": "user",
                        "values": [],
                        "variation": 1
                    }
                ],
                "fallthrough": {
                    "variation": 0
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithMissingPrereq": {
                "key": "flagWithMissingPrereq",
                "on": true,
                "prerequisites": [
                    {
                        "key": "badPrereq",
                        "variation": 1
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithOffPrereq": {
                "key": "flagWithOffPrereq",
                "on": true,
                "prerequisites": [
                    {
                        "key": "offPrereq",
                        "variation": 1
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithFirstPrereqAsPrereqToSecondPrereq": {
                "key": "flagWithFirstPrereqAsPrereqToSecondPrereq",
                "on": true,
                "prerequisites": [
                    {
                        "key": "prereq",
                        "variation": 1
                    },
                    {
                        "key": "flagWithSatisfiedPrereq",
                        "variation": 1
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithNestedPrereq": {
                "key": "flagWithNestedPrereq",
                "on": true,
                "prerequisites": [
                    {
                        "key": "flagWithSatisfiedPrereq",
                        "variation": 1
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithSatisfiedPrereq": {
                "key": "flagWithSatisfiedPrereq",
                "on": true,
                "prerequisites": [
                    {
                        "key": "prereq",
                        "variation": 1
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "prereq": {
                "key": "prereq",
                "on": true,
                "targets": [
                    {
                        "values": ["bob"],
                        "variation": 0
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "offPrereq": {
                "key": "offPrereq",
                "on": false,
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 1,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithInRule": {
                "key": "flagWithInRule",
                "on": false,
                "rules": [
                    {
                        "id": "in-rule",
                        "clauses": [
                            {
                                "attribute": "team",
                                "op": "in",
                                "values": ["Avengers"]
                            }
                        ],
                        "variation": 0
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithSegmentMatchRule": {
                "key": "flagWithSegmentMatchRule",
                "on": true,
                "rules": [
                    {
                        "id": "match-rule",
                        "clauses": [
                            {
                                "contextKind": "user",
                                "attribute": "key",
                                "op": "segmentMatch",
                                "values": ["segment"]
                            }
                        ],
                        "variation": 0
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithPrereqWhichDuplicatesSegmentRuleCheck": {
                "key": "flagWithPrereqWhichDuplicatesSegmentRuleCheck",
                "on": true,
                "rules": [
                    {
                        "id": "match-rule",
                        "clauses": [
                            {
                                "contextKind": "user",
                                "attribute": "key",
                                "op": "segmentMatch",
                                "values": ["segment"]
                            }
                        ],
                        "variation": 0
                    }
                ],
                "prerequisites": [
                    {
                        "key": "flagWithSegmentMatchRule",
                        "variation": 0
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            },
            "flagWithMalformedRule": {
                "key": "flagWithMalformedRule",
                "on": false,
                "rules": [
                    {
                        "id": "in-rule",
                        "clauses": [
                            {
                                "attribute": "key",
                                "op": "in",
                                "values": ["yes"]
                            }
                        ]
                    }
                ],
                "fallthrough": {
                    "variation": 1
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "salty"
            }
        }"#;
        let segments = r#"{
            "segment": {
                "key": "segment",
                "included": ["alice"],
                "includedContexts": [
                    {
                        "values": [],
                        "contextKind": "user"
                    }
                ],
                "salt": "salty"
            }
        }"#;
        Self::new_from_json_str(flags, segments)
    }

    pub fn new_from_json_str(flag_json: &str, segment_json: &str) -> Self {
        let flags = serde_json::from_str(flag_json).unwrap();
        let segments = serde_json::from_str(segment_json).unwrap();

        Self {
            flags,
            segments,
            big_segments: None,
            big_segment_queries: AtomicUsize::new(0),
        }
    }

    pub fn with_segments(segments: Vec<Segment>) -> Self {
        Self {
            flags: HashMap::new(),
            segments: segments
                .into_iter()
                .map(|segment| (segment.key.clone(), segment))
                .collect(),
            big_segments: None,
            big_segment_queries: AtomicUsize::new(0),
        }
    }

    /// Configures big segments: every query answers with `status`, and with the membership
    /// listed for the context key, if any.
    pub fn with_big_segments(
        mut self,
        status: BigSegmentsStatus,
        memberships: HashMap<String, BigSegmentMembership>,
    ) -> Self {
        self.big_segments = Some((status, memberships));
        self
    }

    pub fn big_segment_queries(&self) -> usize {
        self.big_segment_queries.load(Ordering::SeqCst)
    }

    pub fn update_flag(&mut self, flag_key: &str, fun: fn(&mut Flag)) {
        let flag = self.flags.get_mut(flag_key).unwrap();
        fun(flag);
    }
}

#[async_trait]
impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<&Flag> {
        self.flags.get(flag_key)
    }

    fn segment(&self, segment_key: &str) -> Option<&Segment> {
        self.segments.get(segment_key)
    }

    async fn big_segment_membership(&self, context_key: &str) -> Option<BigSegmentMembershipResult> {
        self.big_segment_queries.fetch_add(1, Ordering::SeqCst);
        let (status, memberships) = self.big_segments.as_ref()?;
        Some(BigSegmentMembershipResult {
            membership: memberships.get(context_key).cloned(),
            status: *status,
        })
    }
}

/// A flag serving `true` to contexts in any of `segment_keys` and `false` to everyone else.
pub fn segment_match_flag(segment_keys: &[&str]) -> Flag {
    serde_json::from_value(json!({
        "key": "segmentMatchFlag",
        "on": true,
        "rules": [{
            "id": "segment-rule",
            "clauses": [{
                "attribute": "key",
                "op": "segmentMatch",
                "values": segment_keys
            }],
            "variation": 1
        }],
        "fallthrough": {"variation": 0},
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    }))
    .unwrap()
}

/// Records each prerequisite evaluation as a (prerequisite key, dependent flag key) pair.
pub struct KeyEventFactory;

impl EventFactory for KeyEventFactory {
    type Event = (String, String);

    fn prerequisite_event(
        &self,
        prerequisite_flag: &Flag,
        _context: &Context,
        _detail: &Detail<&FlagValue>,
        prerequisite_of: &Flag,
    ) -> (String, String) {
        (prerequisite_flag.key.clone(), prerequisite_of.key.clone())
    }
}
