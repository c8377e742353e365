use crate::gpu::{GpuBackend, GpuError, ProgramId, ProgramKind};

use super::GpuResource;

#[derive(Debug)]
pub struct ShaderProgram {
    kind: ProgramKind,
    program: Option<ProgramId>,
}

impl ShaderProgram {
    pub fn new(kind: ProgramKind) -> Self {
        Self {
            kind,
            program: None,
        }
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn id(&self) -> Option<ProgramId> {
        self.program
    }
}

impl GpuResource for ShaderProgram {
    fn reserve(&mut self, gpu: &mut dyn GpuBackend) -> Result<(), GpuError> {
        if self.program.is_some() {
            self.release(Some(&mut *gpu));
        }
        self.program = Some(gpu.create_program(self.kind)?);
        tracing::debug!(kind = ?self.kind, "compiled quad program");
        Ok(())
    }

    fn release(&mut self, gpu: Option<&mut dyn GpuBackend>) {
        if let (Some(gpu), Some(program)) = (gpu, self.program.take()) {
            gpu.delete_program(program);
        }
        self.program = None;
    }
}
