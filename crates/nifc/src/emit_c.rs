//! C backend.
//!
//! Emits one self-contained header: a small stream prelude, enums as integer typedefs
//! with `#define`d options, one struct with a `T_read` and a `T_free` function per
//! concrete record (generic compounds are monomorphized per template argument) and a
//! block table mapping type tags to readers and destructors.

use std::collections::{BTreeMap, BTreeSet};

use crate::compile::{CompileError, CompileErrorKind};
use crate::emit_common::{
    banner, c_escape_c_string, c_field_ident, c_type_ident, const_ident, doc_line, Layouts,
    Members, Writer,
};
use crate::expr::{BinaryOp, Expr, UnaryOp, USER_VERSION_2_IDENT, USER_VERSION_IDENT, VERSION_IDENT};
use crate::guard::VersionGate;
use crate::ir::{Node, Program, Test};
use crate::model::{packed_layout, Entity, EntityId, EntityKind, EnumDef, Field, Record};
use crate::registry::{ArrayLen, CRules, Literal, PrefixWidth, Primitive, TypeRef, TypeRules};

const C_PRELUDE: &str = r#"#include <stdbool.h>
#include <stddef.h>
#include <stdint.h>
#include <stdlib.h>
#include <string.h>

#define NIF_OK 0
#define NIF_ERR_TRUNCATED 1
#define NIF_ERR_INVALID 2
#define NIF_ERR_ALLOC 3

#define NIF_TRY(expr) \
    do { \
        int nif_rc_ = (expr); \
        if (nif_rc_ != NIF_OK) return nif_rc_; \
    } while (0)

typedef struct nif_stream {
    const uint8_t *data;
    size_t len;
    size_t pos;
    bool big_endian;
} nif_stream_t;

typedef struct nif_ctx {
    uint32_t version;
    uint32_t user_version;
    uint32_t user_version_2;
} nif_ctx_t;

typedef int32_t nif_ref_t;

typedef struct nif_text {
    char *data;
    uint32_t len;
} nif_text_t;

typedef struct nif_bytes {
    uint8_t *data;
    uint32_t len;
} nif_bytes_t;

/* Inline text before 20.1.0.1, an index into the header string table from then on. */
typedef struct nif_string {
    nif_text_t text;
    uint32_t index;
    bool indexed;
} nif_string_t;

static inline size_t nif_stream_remaining(const nif_stream_t *s) {
    return s->pos < s->len ? s->len - s->pos : 0;
}

static inline int nif_take(nif_stream_t *s, size_t n, const uint8_t **p) {
    if (nif_stream_remaining(s) < n) return NIF_ERR_TRUNCATED;
    *p = s->data + s->pos;
    s->pos += n;
    return NIF_OK;
}

static inline uint64_t nif_load(const uint8_t *p, size_t n, bool big_endian) {
    uint64_t v = 0;
    for (size_t i = 0; i < n; i++) {
        v |= (uint64_t)p[big_endian ? n - 1 - i : i] << (8 * i);
    }
    return v;
}

static inline float nif_bits_f32(uint32_t bits) {
    float f;
    memcpy(&f, &bits, sizeof f);
    return f;
}

static inline float nif_half_f32(uint16_t h) {
    uint32_t sign = (uint32_t)(h & 0x8000u) << 16;
    uint32_t exp = (h >> 10) & 0x1fu;
    uint32_t man = h & 0x3ffu;
    if (exp == 0) {
        float f = (float)man / 16777216.0f;
        return sign ? -f : f;
    }
    if (exp == 31) return nif_bits_f32(sign | 0x7f800000u | (man << 13));
    return nif_bits_f32(sign | ((exp + 112u) << 23) | (man << 13));
}

#define NIF_DEFINE_READER(name, type, width) \
    static inline int name(nif_stream_t *s, type *out) { \
        const uint8_t *p; \
        NIF_TRY(nif_take(s, width, &p)); \
        *out = (type)nif_load(p, width, s->big_endian); \
        return NIF_OK; \
    }

NIF_DEFINE_READER(nif_read_u8, uint8_t, 1)
NIF_DEFINE_READER(nif_read_i8, int8_t, 1)
NIF_DEFINE_READER(nif_read_u16, uint16_t, 2)
NIF_DEFINE_READER(nif_read_i16, int16_t, 2)
NIF_DEFINE_READER(nif_read_u32, uint32_t, 4)
NIF_DEFINE_READER(nif_read_i32, int32_t, 4)
NIF_DEFINE_READER(nif_read_u64, uint64_t, 8)
NIF_DEFINE_READER(nif_read_i64, int64_t, 8)
NIF_DEFINE_READER(nif_read_char, char, 1)

static inline int nif_read_f32(nif_stream_t *s, float *out) {
    uint32_t bits;
    NIF_TRY(nif_read_u32(s, &bits));
    *out = nif_bits_f32(bits);
    return NIF_OK;
}

static inline int nif_read_f16(nif_stream_t *s, float *out) {
    uint16_t h;
    NIF_TRY(nif_read_u16(s, &h));
    *out = nif_half_f32(h);
    return NIF_OK;
}

/* 32-bit before 4.1.0.1, 8-bit from then on. */
static inline int nif_read_bool(nif_stream_t *s, const nif_ctx_t *ctx, bool *out) {
    if (ctx->version >= 0x04010001u) {
        uint8_t v;
        NIF_TRY(nif_read_u8(s, &v));
        *out = v != 0;
    } else {
        uint32_t v;
        NIF_TRY(nif_read_u32(s, &v));
        *out = v != 0;
    }
    return NIF_OK;
}

static inline int nif_read_counted(nif_stream_t *s, uint32_t n, nif_text_t *out) {
    const uint8_t *p;
    NIF_TRY(nif_take(s, n, &p));
    out->data = malloc((size_t)n + 1);
    if (out->data == NULL) return NIF_ERR_ALLOC;
    memcpy(out->data, p, n);
    out->data[n] = '\0';
    out->len = n;
    return NIF_OK;
}

static inline int nif_read_sized_string(nif_stream_t *s, nif_text_t *out) {
    uint32_t n;
    NIF_TRY(nif_read_u32(s, &n));
    return nif_read_counted(s, n, out);
}

static inline int nif_read_short_string(nif_stream_t *s, nif_text_t *out) {
    uint8_t n;
    NIF_TRY(nif_read_u8(s, &n));
    NIF_TRY(nif_read_counted(s, n, out));
    if (out->len > 0 && out->data[out->len - 1] == '\0') out->len--;
    return NIF_OK;
}

static inline int nif_read_line_string(nif_stream_t *s, nif_text_t *out) {
    size_t start = s->pos;
    size_t n = 0;
    for (;;) {
        uint8_t b;
        NIF_TRY(nif_read_u8(s, &b));
        if (b == '\n') break;
        if (++n > 256) return NIF_ERR_INVALID;
    }
    s->pos = start;
    NIF_TRY(nif_read_counted(s, (uint32_t)n, out));
    s->pos++;
    return NIF_OK;
}

static inline int nif_read_byte_blob(nif_stream_t *s, nif_bytes_t *out) {
    nif_text_t text;
    NIF_TRY(nif_read_sized_string(s, &text));
    out->data = (uint8_t *)text.data;
    out->len = text.len;
    return NIF_OK;
}

static inline int nif_read_string(nif_stream_t *s, const nif_ctx_t *ctx, nif_string_t *out) {
    if (ctx->version >= 0x14010001u) {
        out->indexed = true;
        return nif_read_u32(s, &out->index);
    }
    out->indexed = false;
    return nif_read_sized_string(s, &out->text);
}

static inline int64_t nif_add(int64_t a, int64_t b) { return (int64_t)((uint64_t)a + (uint64_t)b); }
static inline int64_t nif_sub(int64_t a, int64_t b) { return (int64_t)((uint64_t)a - (uint64_t)b); }
static inline int64_t nif_mul(int64_t a, int64_t b) { return (int64_t)((uint64_t)a * (uint64_t)b); }
static inline int64_t nif_neg(int64_t a) { return (int64_t)(0u - (uint64_t)a); }
static inline int64_t nif_div(int64_t a, int64_t b) { return (b == 0 || (a == INT64_MIN && b == -1)) ? 0 : a / b; }
static inline int64_t nif_mod(int64_t a, int64_t b) { return (b == 0 || (a == INT64_MIN && b == -1)) ? 0 : a % b; }
static inline int64_t nif_shl(int64_t a, int64_t b) { return (int64_t)((uint64_t)a << ((uint64_t)b & 63u)); }
static inline int64_t nif_shr(int64_t a, int64_t b) { return a >> ((uint64_t)b & 63u); }

/* Element count of a rows x cols array; -1 when either side is negative or the product overflows. */
static inline int64_t nif_area(int64_t rows, int64_t cols) {
    if (rows < 0 || cols < 0) return -1;
    if (cols != 0 && rows > INT64_MAX / cols) return -1;
    return rows * cols;
}

static inline int nif_alloc_array(int64_t len, size_t elem, void **out, uint32_t *count) {
    *out = NULL;
    *count = 0;
    if (len < 0 || (uint64_t)len > UINT32_MAX) return NIF_ERR_INVALID;
    if (len == 0) return NIF_OK;
    *out = calloc((size_t)len, elem);
    if (*out == NULL) return NIF_ERR_ALLOC;
    *count = (uint32_t)len;
    return NIF_OK;
}

#define NIF_READ_ARRAY(s, len, dst, count, read_one) \
    do { \
        void *nif_mem_; \
        NIF_TRY(nif_alloc_array((len), sizeof(*(dst)), &nif_mem_, &(count))); \
        (dst) = nif_mem_; \
        for (uint32_t nif_i = 0; nif_i < (count); nif_i++) { \
            read_one; \
        } \
    } while (0)

#define NIF_READ_PREFIXED_ARRAY(s, ptype, preader, dst, count, read_one) \
    do { \
        ptype nif_n_; \
        NIF_TRY(preader((s), &nif_n_)); \
        NIF_READ_ARRAY((s), (int64_t)nif_n_, dst, count, read_one); \
    } while (0)

static inline void nif_free_text(nif_text_t *t) {
    free(t->data);
    t->data = NULL;
    t->len = 0;
}

static inline void nif_free_bytes(nif_bytes_t *b) {
    free(b->data);
    b->data = NULL;
    b->len = 0;
}

static inline void nif_free_string(nif_string_t *str) {
    nif_free_text(&str->text);
}

typedef int (*nif_block_read_fn)(nif_stream_t *s, const nif_ctx_t *ctx, void **out);
typedef void (*nif_block_free_fn)(void *block);

/* A failed read leaves nothing allocated; a successful block is released with free_block. */
typedef struct nif_block_entry {
    const char *type_name;
    nif_block_read_fn read;
    nif_block_free_fn free_block;
} nif_block_entry_t;
"#;

pub fn emit(program: &Program) -> Result<String, CompileError> {
    let layouts = Layouts::build(program, &CRules, c_field_ident, member_key)?;
    let instances = collect_instances(program)?;
    let mut e = CEmitter {
        program,
        layouts,
        instances,
        w: Writer::new(),
    };
    e.header();
    for entity in &program.model.entities {
        if let EntityKind::Enum(def) = &entity.kind {
            e.enumeration(entity, def)?;
        }
    }
    e.structs()?;
    e.prototypes();
    for i in 0..e.instances.len() {
        e.read_fn(i)?;
    }
    e.dispatch();
    e.w.blank();
    e.w.line("#endif");
    Ok(e.w.finish())
}

/// C members are laid out per generic declaration, so the sharing key is the schema type
/// rather than a C spelling.
fn member_key(_rules: &dyn TypeRules, f: &Field) -> Result<String, CompileError> {
    let dims = match (f.arr1.is_some(), f.arr2.is_some()) {
        (false, _) => "",
        (true, false) => "[]",
        (true, true) => "[][]",
    };
    Ok(format!("{}{dims}", f.ty))
}

/// A concrete C struct: a record, monomorphized when it is generic.
#[derive(Debug, Clone)]
struct Instance {
    id: EntityId,
    template: Option<TypeRef>,
    ident: String,
}

fn subst(ty: &TypeRef, template: Option<&TypeRef>) -> TypeRef {
    match template {
        Some(t) => ty.substitute(t),
        None => ty.clone(),
    }
}

/// Every non-generic record plus every generic instance reachable from one.
fn collect_instances(program: &Program) -> Result<Vec<Instance>, CompileError> {
    let model = &program.model;
    let mut list: Vec<Instance> = Vec::new();
    let mut seen = BTreeSet::new();
    let mut push = |id: EntityId, template: Option<TypeRef>, list: &mut Vec<Instance>| {
        let ident = CRules::compound_ident(&model.entity(id).name, template.as_ref())?;
        if seen.insert(ident.clone()) {
            list.push(Instance {
                id,
                template,
                ident,
            });
        }
        Ok::<(), CompileError>(())
    };
    for entity in &model.entities {
        if entity.record().is_some_and(|r| !r.generic) {
            push(entity.id, None, &mut list)?;
        }
    }
    let mut i = 0;
    while i < list.len() {
        let inst = list[i].clone();
        if let Some(record) = model.record(inst.id) {
            for field in &record.fields {
                if let TypeRef::Compound { id, template, .. } =
                    subst(&field.ty, inst.template.as_ref())
                {
                    push(id, template.map(|t| *t), &mut list)?;
                }
            }
        }
        i += 1;
    }
    Ok(list)
}

/// Value of `value` (of type `ty`) as an `int64_t`.
fn widen(value: &str, ty: &TypeRef) -> String {
    match ty.primitive() {
        Some(Primitive::Char) => format!("(int64_t)(unsigned char){value}"),
        _ => format!("(int64_t){value}"),
    }
}

/// Wraps `s` in parentheses unless one pair already encloses all of it.
fn parens(s: &str) -> String {
    let mut depth = 0i32;
    let enclosed = s.starts_with('(')
        && s.char_indices().all(|(i, c)| {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            depth > 0 || i == s.len() - 1
        });
    if enclosed {
        s.to_string()
    } else {
        format!("({s})")
    }
}

fn comment(doc: &str) -> String {
    format!("/* {} */", doc_line(doc).replace("*/", "* /"))
}

struct CEmitter<'p> {
    program: &'p Program,
    layouts: Layouts<'p>,
    instances: Vec<Instance>,
    w: Writer,
}

impl CEmitter<'_> {
    fn header(&mut self) {
        self.w.line(&format!("/* {} */", banner(self.program)));
        self.w.line("#ifndef NIF_GENERATED_H");
        self.w.line("#define NIF_GENERATED_H");
        self.w.blank();
        for l in C_PRELUDE.lines() {
            if l.is_empty() {
                self.w.blank();
            } else {
                self.w.line(l);
            }
        }
        let mut seen = BTreeSet::new();
        let versions: Vec<_> = self
            .program
            .model
            .versions
            .iter()
            .filter(|(id, _)| seen.insert(const_ident(id)))
            .collect();
        if !versions.is_empty() {
            self.w.blank();
            for (id, num) in versions {
                self.w.line(&format!(
                    "#define {} 0x{:08X}u /* {num} */",
                    const_ident(id),
                    num.raw()
                ));
            }
        }
    }

    fn doc(&mut self, doc: &Option<String>) {
        if let Some(d) = doc.as_deref().filter(|d| !doc_line(d).is_empty()) {
            self.w.line(&comment(d));
        }
    }

    fn enumeration(&mut self, entity: &Entity, def: &EnumDef) -> Result<(), CompileError> {
        let name = c_type_ident(&entity.name);
        let storage = TypeRef::Basic {
            name: def.storage_name.clone(),
            prim: def.storage,
        };
        let prefix = const_ident(&entity.name);
        self.w.blank();
        self.doc(&entity.doc);
        self.w
            .line(&format!("typedef {} {name};", CRules.repr(&storage)?));
        let mut seen = BTreeSet::new();
        for opt in &def.options {
            let mut ident = format!("{prefix}_{}", const_ident(&opt.name));
            while !seen.insert(ident.clone()) {
                ident.push('_');
            }
            let value = if def.bitflags && opt.value > 0 && opt.value & (opt.value - 1) == 0 {
                let one = if def.storage == Primitive::U64 { "1ull" } else { "1u" };
                format!("({one} << {})", opt.value.trailing_zeros())
            } else {
                CRules.default_literal(&storage, Literal::Int(opt.value))?
            };
            self.w.line(&format!("#define {ident} {value}"));
        }
        Ok(())
    }

    fn members(&self, id: EntityId) -> Result<Members, CompileError> {
        self.layouts.members(id).cloned().ok_or_else(|| {
            internal(format!(
                "{} has no member layout",
                self.program.model.entity(id).name
            ))
        })
    }

    fn structs(&mut self) -> Result<(), CompileError> {
        if self.instances.is_empty() {
            return Ok(());
        }
        self.w.blank();
        for inst in &self.instances {
            self.w
                .line(&format!("typedef struct {0} {0};", inst.ident));
        }
        let by_ident: BTreeMap<String, usize> = self
            .instances
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.ident.clone(), i))
            .collect();
        let mut marks = vec![Mark::Open; self.instances.len()];
        for i in 0..self.instances.len() {
            self.define(i, &by_ident, &mut marks)?;
        }
        Ok(())
    }

    /// Defines instance `i` after every struct it embeds by value.
    fn define(
        &mut self,
        i: usize,
        by_ident: &BTreeMap<String, usize>,
        marks: &mut [Mark],
    ) -> Result<(), CompileError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Active => {
                return Err(CompileError::new(
                    CompileErrorKind::Emit,
                    format!(
                        "{} contains itself by value; C structs cannot be recursive",
                        self.instances[i].ident
                    ),
                ))
            }
            Mark::Open => marks[i] = Mark::Active,
        }
        let inst = self.instances[i].clone();
        let program = self.program;
        let model = &program.model;
        let entity = model.entity(inst.id);
        let record = entity
            .record()
            .ok_or_else(|| internal(format!("{} is not a record", entity.name)))?;
        let members = self.members(inst.id)?;

        let mut deps = Vec::new();
        if let Some(sup) = record.inherit {
            deps.push(c_type_ident(&model.entity(sup).name));
        }
        for m in &members.list {
            let field = &record.fields[m.field];
            let ty = subst(&field.ty, inst.template.as_ref());
            if !field.is_array() && matches!(ty, TypeRef::Compound { .. }) {
                deps.push(CRules.repr(&ty)?);
            }
        }
        for dep in deps {
            if let Some(&j) = by_ident.get(&dep) {
                self.define(j, by_ident, marks)?;
            }
        }

        self.w.blank();
        self.doc(&entity.doc);
        self.w.open_block(&format!("struct {}", inst.ident));
        if let Some(sup) = record.inherit {
            self.w
                .line(&format!("{} base;", c_type_ident(&model.entity(sup).name)));
        }
        for m in &members.list {
            let field = &record.fields[m.field];
            let ty = subst(&field.ty, inst.template.as_ref());
            let repr = match m.widened {
                Some(wide) => CRules::prim_repr(wide).to_string(),
                None => CRules.repr(&ty).map_err(|e| in_field(entity, field, e))?,
            };
            self.doc(&field.doc);
            if field.is_array() {
                self.w.line(&format!("{repr} *{};", m.ident));
                self.w.line(&format!("uint32_t {}_count;", m.ident));
            } else {
                self.w.line(&format!("{repr} {};", m.ident));
            }
        }
        if members.list.is_empty() && record.inherit.is_none() {
            self.w.line("uint8_t unused_;");
        }
        self.w.close_block_with("};");
        marks[i] = Mark::Done;
        Ok(())
    }

    fn prototypes(&mut self) {
        if self.instances.is_empty() {
            return;
        }
        self.w.blank();
        for inst in &self.instances {
            self.w.line(&format!("{};", read_signature(&inst.ident)));
            self.w.line(&format!("{};", free_signature(&inst.ident)));
        }
    }

    fn read_fn(&mut self, i: usize) -> Result<(), CompileError> {
        let inst = self.instances[i].clone();
        let program = self.program;
        let entity = program.model.entity(inst.id);
        let record = entity
            .record()
            .ok_or_else(|| internal(format!("{} is not a record", entity.name)))?;
        let members = self.members(inst.id)?;

        self.free_fn(&inst, record, &members)?;

        self.w.blank();
        self.w.open_block(&format!(
            "static inline int {}_read_fields(nif_stream_t *s, const nif_ctx_t *ctx, int64_t arg, {} *out)",
            inst.ident, inst.ident
        ));
        self.w.line("(void)ctx;");
        self.w.line("(void)arg;");
        if let Some(sup) = record.inherit {
            self.w.line(&format!(
                "NIF_TRY({}_read(s, ctx, arg, &out->base));",
                c_type_ident(&program.model.entity(sup).name)
            ));
        }
        for m in &members.list {
            if let Some((ty, lit)) = &m.default {
                let value = CRules.default_literal(ty, *lit)?;
                self.w.line(&format!("out->{} = {value};", m.ident));
            }
        }
        if record.packed {
            self.packed_reads(record, &members)?;
        } else {
            let compact = program.record(inst.id).cloned().unwrap_or_default();
            let cx = Cx {
                record,
                members: &members,
                entity,
                template: inst.template.as_ref(),
            };
            self.nodes(&cx, &compact.nodes)?;
        }
        self.w.line("return NIF_OK;");
        self.w.close_block();

        self.w.blank();
        self.w.open_block(&read_signature(&inst.ident));
        self.w.line("memset(out, 0, sizeof(*out));");
        self.w.line(&format!(
            "int rc = {}_read_fields(s, ctx, arg, out);",
            inst.ident
        ));
        self.w
            .line(&format!("if (rc != NIF_OK) {}_free(out);", inst.ident));
        self.w.line("return rc;");
        self.w.close_block();
        Ok(())
    }

    /// Releases everything a read of `inst` allocated and resets it to empty, so freeing
    /// twice is harmless.
    fn free_fn(
        &mut self,
        inst: &Instance,
        record: &Record,
        members: &Members,
    ) -> Result<(), CompileError> {
        let model = &self.program.model;
        let mut body = Vec::new();
        if let Some(sup) = record.inherit {
            body.push(format!("{}_free(&v->base);", c_type_ident(&model.entity(sup).name)));
        }
        for m in &members.list {
            let field = &record.fields[m.field];
            let ty = subst(&field.ty, inst.template.as_ref());
            let release = release_fn(&ty)?;
            if field.is_array() {
                if let Some(f) = &release {
                    body.push(format!(
                        "for (uint32_t nif_i = 0; nif_i < v->{0}_count && v->{0} != NULL; nif_i++) {f}(&v->{0}[nif_i]);",
                        m.ident
                    ));
                }
                body.push(format!("free(v->{});", m.ident));
                body.push(format!("v->{} = NULL;", m.ident));
                body.push(format!("v->{}_count = 0;", m.ident));
            } else if let Some(f) = &release {
                body.push(format!("{f}(&v->{});", m.ident));
            }
        }
        self.w.blank();
        self.w.open_block(&free_signature(&inst.ident));
        if body.is_empty() {
            self.w.line("(void)v;");
        }
        for l in body {
            self.w.line(&l);
        }
        self.w.close_block();
        Ok(())
    }

    fn packed_reads(&mut self, record: &Record, members: &Members) -> Result<(), CompileError> {
        let (size, offsets) = packed_layout(record);
        self.w.line("const uint8_t *p;");
        self.w.line(&format!("NIF_TRY(nif_take(s, {size}, &p));"));
        for (i, field) in record.fields.iter().enumerate() {
            let Some(m) = members.of_field(i) else {
                continue;
            };
            let off = offsets[i];
            let prim = match &field.ty {
                TypeRef::Basic { prim, .. } => *prim,
                TypeRef::Enum { storage, .. } => *storage,
                other => return Err(internal(format!("packed field of type {other}"))),
            };
            let width = prim
                .packed_size()
                .ok_or_else(|| internal(format!("packed field of primitive {prim}")))?;
            let load = format!("nif_load(p + {off}, {width}, s->big_endian)");
            let value = match prim {
                Primitive::F32 => format!("nif_bits_f32((uint32_t){load})"),
                Primitive::F16 => format!("nif_half_f32((uint16_t){load})"),
                other => format!("({}){load}", CRules::prim_repr(other)),
            };
            let value = match m.widens(field) {
                Some(wide) => format!("({}){value}", CRules::prim_repr(wide)),
                None => value,
            };
            self.w.line(&format!("out->{} = {value};", m.ident));
        }
        Ok(())
    }

    fn nodes(&mut self, cx: &Cx<'_>, nodes: &[Node]) -> Result<(), CompileError> {
        for node in nodes {
            self.node(cx, node)?;
        }
        Ok(())
    }

    fn node(&mut self, cx: &Cx<'_>, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Read(read) => {
                let field = &cx.record.fields[read.field];
                let member = cx.members.of_field(read.field).ok_or_else(|| {
                    internal(format!("{}: field {:?} has no member", cx.entity.name, field.name))
                })?;
                if let Some(wide) = member.widens(field) {
                    // Read at the field's own width, then store into the shared member.
                    let ty = subst(&field.ty, cx.template);
                    self.w.open_block("");
                    self.w.line(&format!("{} nif_v;", CRules.repr(&ty)?));
                    self.w.line(&CRules.read_one(&ty, "nif_v", "0")?);
                    self.w.line(&format!(
                        "out->{} = ({})nif_v;",
                        member.ident,
                        CRules::prim_repr(wide)
                    ));
                    self.w.close_block();
                    return Ok(());
                }
                let lines = self
                    .read_lines(cx, field, &member.ident, read.prefix.as_ref().map(|p| p.width))
                    .map_err(|e| in_field(cx.entity, field, e))?;
                for l in lines {
                    self.w.line(&l);
                }
            }
            Node::Gate { body, .. } => {
                self.w.open_block("");
                self.w.line("bool nif_gate;");
                self.w.line("NIF_TRY(nif_read_bool(s, ctx, &nif_gate));");
                self.w.open_block("if (nif_gate)");
                self.nodes(cx, body)?;
                self.w.close_block();
                self.w.close_block();
            }
            Node::If { arms, otherwise } => {
                for (i, arm) in arms.iter().enumerate() {
                    let test = match &arm.test {
                        Test::Version(g) => version_test(g),
                        Test::Cond(e) => self.render_bool(cx, e)?,
                    };
                    if i == 0 {
                        self.w.open_block(&format!("if {}", parens(&test)));
                    } else {
                        self.w
                            .close_block_with(&format!("}} else if {} {{", parens(&test)));
                        self.w.indent += 1;
                    }
                    self.nodes(cx, &arm.body)?;
                }
                if let Some(body) = otherwise {
                    self.w.close_block_with("} else {");
                    self.w.indent += 1;
                    self.nodes(cx, body)?;
                }
                self.w.close_block();
            }
            Node::Switch {
                on,
                cases,
                otherwise,
            } => {
                let on = self.render_int(cx, on)?;
                self.w.open_block(&format!("switch {}", parens(&on)));
                for case in cases {
                    self.w
                        .open_block(&format!("case {}:", int_literal(case.value)));
                    self.nodes(cx, &case.body)?;
                    self.w.line("break;");
                    self.w.close_block();
                }
                match otherwise {
                    Some(body) => {
                        self.w.open_block("default:");
                        self.nodes(cx, body)?;
                        self.w.line("break;");
                        self.w.close_block();
                    }
                    None => {
                        self.w.line("default:");
                        self.w.indent += 1;
                        self.w.line("break;");
                        self.w.indent -= 1;
                    }
                }
                self.w.close_block();
            }
        }
        Ok(())
    }

    fn read_lines(
        &self,
        cx: &Cx<'_>,
        field: &Field,
        ident: &str,
        prefix: Option<PrefixWidth>,
    ) -> Result<Vec<String>, CompileError> {
        let ty = subst(&field.ty, cx.template);
        let dst = format!("out->{ident}");
        let count = format!("out->{ident}_count");
        let arg = match &field.arg {
            Some(a) => self.render_int(cx, a)?,
            None => "0".to_string(),
        };
        let Some(arr1) = &field.arr1 else {
            return Ok(vec![CRules.read_one(&ty, &dst, &arg)?]);
        };
        if let Some(width) = prefix {
            return Ok(vec![CRules.read_array(
                &ty,
                ArrayLen::Prefix(width),
                &dst,
                &count,
                &arg,
            )?]);
        }
        let rows = self.render_int(cx, arr1)?;
        let Some(arr2) = &field.arr2 else {
            return Ok(vec![CRules.read_array(
                &ty,
                ArrayLen::Expr(&rows),
                &dst,
                &count,
                &arg,
            )?]);
        };
        if !field.jagged {
            let cols = self.render_int(cx, arr2)?;
            let len = format!("nif_area({rows}, {cols})");
            return Ok(vec![CRules.read_array(
                &ty,
                ArrayLen::Expr(&len),
                &dst,
                &count,
                &arg,
            )?]);
        }
        // Jagged rows are stored flat; the row lengths stay in their own member.
        let lens = arr2
            .as_ident()
            .ok_or_else(|| internal("jagged array without a lengths field".to_string()))?;
        let (path, lens_field) = self.layouts.access(cx.record, lens)?;
        let read = CRules.read_array(&ty, ArrayLen::Expr("nif_total"), &dst, &count, &arg)?;
        Ok(vec![
            "{".to_string(),
            format!("    int64_t nif_rows = {rows};"),
            "    int64_t nif_total = 0;".to_string(),
            "    if (nif_rows < 0) return NIF_ERR_INVALID;".to_string(),
            format!(
                "    for (int64_t nif_r = 0; nif_r < nif_rows && nif_r < (int64_t)out->{path}_count; nif_r++) {{"
            ),
            format!(
                "        int64_t nif_n = {};",
                widen(&format!("out->{path}[nif_r]"), &lens_field.ty)
            ),
            "        if (nif_n < 0) return NIF_ERR_INVALID;".to_string(),
            "        nif_total = nif_add(nif_total, nif_n);".to_string(),
            "    }".to_string(),
            format!("    {read}"),
            "}".to_string(),
        ])
    }

    fn render_int(&self, cx: &Cx<'_>, e: &Expr) -> Result<String, CompileError> {
        Ok(match e {
            Expr::Int(v) => int_literal(*v),
            Expr::Version(v) => format!("INT64_C(0x{v:08X})"),
            Expr::Arg => "arg".to_string(),
            Expr::Ident(name) => match name.as_str() {
                VERSION_IDENT => "(int64_t)ctx->version".to_string(),
                USER_VERSION_IDENT => "(int64_t)ctx->user_version".to_string(),
                USER_VERSION_2_IDENT => "(int64_t)ctx->user_version_2".to_string(),
                _ => {
                    let (path, field) = self.layouts.access(cx.record, name)?;
                    widen(&format!("out->{path}"), &field.ty)
                }
            },
            Expr::Unary(UnaryOp::Neg, inner) => format!("nif_neg({})", self.render_int(cx, inner)?),
            Expr::Unary(UnaryOp::Not, _) => format!("(int64_t){}", self.render_bool(cx, e)?),
            Expr::Binary(op, _, _) if op.is_boolean() => {
                format!("(int64_t){}", parens(&self.render_bool(cx, e)?))
            }
            Expr::Binary(op, l, r) => {
                let a = self.render_int(cx, l)?;
                let b = self.render_int(cx, r)?;
                let call = |f: &str| format!("{f}({a}, {b})");
                match op {
                    BinaryOp::Mul => call("nif_mul"),
                    BinaryOp::Div => call("nif_div"),
                    BinaryOp::Rem => call("nif_mod"),
                    BinaryOp::Add => call("nif_add"),
                    BinaryOp::Sub => call("nif_sub"),
                    BinaryOp::Shl => call("nif_shl"),
                    BinaryOp::Shr => call("nif_shr"),
                    BinaryOp::BitAnd => format!("({a} & {b})"),
                    BinaryOp::BitXor => format!("({a} ^ {b})"),
                    BinaryOp::BitOr => format!("({a} | {b})"),
                    other => {
                        return Err(internal(format!("operator {} as integer", other.as_str())))
                    }
                }
            }
        })
    }

    fn render_bool(&self, cx: &Cx<'_>, e: &Expr) -> Result<String, CompileError> {
        Ok(match e {
            Expr::Unary(UnaryOp::Not, inner) => format!("!{}", self.render_bool(cx, inner)?),
            Expr::Binary(op @ (BinaryOp::And | BinaryOp::Or), l, r) => format!(
                "({} {} {})",
                self.render_bool(cx, l)?,
                op.as_str(),
                self.render_bool(cx, r)?
            ),
            Expr::Binary(op, l, r) if op.is_boolean() => format!(
                "({} {} {})",
                self.render_int(cx, l)?,
                op.as_str(),
                self.render_int(cx, r)?
            ),
            _ => format!("({} != 0)", self.render_int(cx, e)?),
        })
    }

    fn dispatch(&mut self) {
        let names = self.program.model.dispatch_names();
        for name in &names {
            let ident = c_type_ident(name);
            self.w.blank();
            self.w.open_block(&format!(
                "static inline int {ident}_read_block(nif_stream_t *s, const nif_ctx_t *ctx, void **out)"
            ));
            self.w
                .line(&format!("{ident} *block = calloc(1, sizeof({ident}));"));
            self.w.line("if (block == NULL) return NIF_ERR_ALLOC;");
            self.w
                .line(&format!("int rc = {ident}_read(s, ctx, 0, block);"));
            self.w.open_block("if (rc != NIF_OK)");
            self.w.line("free(block);");
            self.w.line("return rc;");
            self.w.close_block();
            self.w.line("*out = block;");
            self.w.line("return NIF_OK;");
            self.w.close_block();
            self.w.blank();
            self.w
                .open_block(&format!("static inline void {ident}_free_block(void *block)"));
            self.w.open_block("if (block != NULL)");
            self.w.line(&format!("{ident}_free(({ident} *)block);"));
            self.w.line("free(block);");
            self.w.close_block();
            self.w.close_block();
        }
        self.w.blank();
        self.w
            .line("/* Reader and destructor of every concrete block type, keyed by type tag. */");
        self.w
            .open_block("static const nif_block_entry_t nif_block_table[] =");
        for name in &names {
            let ident = c_type_ident(name);
            self.w.line(&format!(
                "{{\"{}\", {ident}_read_block, {ident}_free_block}},",
                c_escape_c_string(name)
            ));
        }
        self.w.line("{NULL, NULL, NULL},");
        self.w.close_block_with("};");
        self.w.blank();
        self.w.open_block(
            "static inline const nif_block_entry_t *nif_find_block(const char *type_name)",
        );
        self.w.open_block(
            "for (const nif_block_entry_t *e = nif_block_table; e->type_name != NULL; e++)",
        );
        self.w
            .line("if (strcmp(e->type_name, type_name) == 0) return e;");
        self.w.close_block();
        self.w.line("return NULL;");
        self.w.close_block();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Open,
    Active,
    Done,
}

/// The record instance a node tree belongs to.
struct Cx<'a> {
    record: &'a Record,
    members: &'a Members,
    entity: &'a Entity,
    template: Option<&'a TypeRef>,
}

fn read_signature(ident: &str) -> String {
    format!(
        "static inline int {ident}_read(nif_stream_t *s, const nif_ctx_t *ctx, int64_t arg, {ident} *out)"
    )
}

fn free_signature(ident: &str) -> String {
    format!("static inline void {ident}_free({ident} *v)")
}

/// The function releasing one value of `ty`, when it owns heap memory.
fn release_fn(ty: &TypeRef) -> Result<Option<String>, CompileError> {
    Ok(match ty {
        TypeRef::Compound { .. } => Some(format!("{}_free", CRules.repr(ty)?)),
        TypeRef::Basic { prim, .. } => match prim {
            Primitive::String => Some("nif_free_string".to_string()),
            Primitive::SizedString
            | Primitive::ShortString
            | Primitive::LineString
            | Primitive::HeaderString => Some("nif_free_text".to_string()),
            Primitive::ByteBlob => Some("nif_free_bytes".to_string()),
            _ => None,
        },
        TypeRef::Enum { .. } | TypeRef::Link { .. } => None,
        TypeRef::Template => return Err(internal("unsubstituted template".to_string())),
    })
}

fn int_literal(v: i64) -> String {
    if v == i64::MIN {
        "INT64_MIN".to_string()
    } else {
        format!("INT64_C({v})")
    }
}

fn version_test(g: &VersionGate) -> String {
    let mut parts = Vec::new();
    if let Some(v) = g.since {
        parts.push(format!("ctx->version >= 0x{:08X}u", v.raw()));
    }
    if let Some(v) = g.until {
        parts.push(format!("ctx->version <= 0x{:08X}u", v.raw()));
    }
    if let Some(v) = g.user_version {
        parts.push(format!("ctx->user_version == {v}u"));
    }
    if let Some(v) = g.user_version_2 {
        parts.push(format!("ctx->user_version_2 == {v}u"));
    }
    if parts.is_empty() {
        "1".to_string()
    } else {
        parts.join(" && ")
    }
}

fn in_field(entity: &Entity, field: &Field, e: CompileError) -> CompileError {
    CompileError::new(
        e.kind,
        format!(
            "{} {}: field {:?}: {}",
            entity.kind_str(),
            entity.name,
            field.name,
            e.message
        ),
    )
}

fn internal(message: String) -> CompileError {
    CompileError::new(CompileErrorKind::Internal, message)
}
