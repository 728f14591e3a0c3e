/// The hardware queue family a pass prefers to run on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QueueSpec {
    pub kind: QueueKind,
}

impl QueueSpec {
    pub fn new(kind: QueueKind) -> Self {
        QueueSpec { kind }
    }
}

/// Opaque backend queue identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QueueId(pub u32);
